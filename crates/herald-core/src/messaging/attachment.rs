use std::{fmt, io::Read, sync::Arc};

use parking_lot::Mutex;

use crate::{Error, Result};

pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

type Reader = Box<dyn Read + Send>;

#[derive(Clone)]
enum Data {
    Inline(Arc<[u8]>),
    /// Taken on first read; the caller keeps ownership until then.
    Stream(Arc<Mutex<Option<Reader>>>),
}

/// Binary payload attached to a message.
#[derive(Clone)]
pub struct Attachment {
    data: Data,
    mimetype: String,
    filename: Option<String>,
}

impl Attachment {
    pub fn inline(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Data::Inline(Arc::from(bytes.into())),
            mimetype: DEFAULT_MIMETYPE.to_string(),
            filename: None,
        }
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            data: Data::Stream(Arc::new(Mutex::new(Some(Box::new(reader))))),
            mimetype: DEFAULT_MIMETYPE.to_string(),
            filename: None,
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = mimetype.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.data, Data::Stream(_))
    }

    /// Return the payload bytes.
    ///
    /// Inline data can be read any number of times. A stream handle is
    /// drained by the first call; later calls fail with `AttachmentConsumed`.
    pub fn read(&self) -> Result<Vec<u8>> {
        match &self.data {
            Data::Inline(bytes) => Ok(bytes.to_vec()),
            Data::Stream(slot) => {
                let mut reader = slot.lock().take().ok_or(Error::AttachmentConsumed)?;
                let mut out = Vec::new();
                reader.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match &self.data {
            Data::Inline(bytes) => format!("{} bytes", bytes.len()),
            Data::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("Attachment")
            .field("data", &data)
            .field("mimetype", &self.mimetype)
            .field("filename", &self.filename)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn inline_defaults_to_octet_stream() {
        let a = Attachment::inline(b"hello".to_vec());
        assert_eq!(a.mimetype(), DEFAULT_MIMETYPE);
        assert_eq!(a.read().unwrap(), b"hello");
        assert_eq!(a.read().unwrap(), b"hello");
    }

    #[test]
    fn stream_is_consumed_once() {
        let a = Attachment::from_reader(Cursor::new(b"pdf".to_vec()))
            .with_mimetype("application/pdf")
            .with_filename("report.pdf");
        assert!(a.is_stream());
        assert_eq!(a.filename(), Some("report.pdf"));
        assert_eq!(a.read().unwrap(), b"pdf");
        assert!(matches!(a.read(), Err(Error::AttachmentConsumed)));
    }
}
