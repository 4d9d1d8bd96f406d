//! SMS-specific helpers: body length limit and one-time-password bodies.

use async_trait::async_trait;
use herald_core::{
    messaging::types::{StatusUpdate, WebhookRequest},
    Capabilities, Driver, Endpoint, Error, Fields, Message, MessageStream, Result,
};
use serde_json::Value;

/// Single-segment SMS body size, in characters.
pub const SMS_MAX_BODY: usize = 160;

/// Rejects sends whose `body` is longer than `max_size` characters before the
/// wrapped driver sees them.
#[derive(Debug)]
pub struct BodyLimit<D> {
    inner: D,
    max_size: usize,
}

impl<D: Driver> BodyLimit<D> {
    pub fn new(inner: D) -> Self {
        Self::with_max(inner, SMS_MAX_BODY)
    }

    pub fn with_max(inner: D, max_size: usize) -> Self {
        Self { inner, max_size }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn check(&self, fields: &Fields) -> Result<()> {
        let Some(body) = fields.get("body").and_then(Value::as_str) else {
            return Ok(());
        };
        if body.chars().count() > self.max_size {
            return Err(Error::body_too_large(
                body,
                self.max_size,
                Some(self.inner.kind()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<D: Driver> Driver for BodyLimit<D> {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn open(&mut self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn send(&mut self, fields: &Fields) -> Result<Message> {
        self.check(fields)?;
        self.inner.send(fields).await
    }

    fn receive(&mut self, limit: usize, options: &Fields) -> MessageStream<'static> {
        self.inner.receive(limit, options)
    }

    fn receive_webhook(&mut self, request: &WebhookRequest) -> MessageStream<'static> {
        self.inner.receive_webhook(request)
    }

    async fn status_callback(&mut self, request: &WebhookRequest) -> Result<StatusUpdate> {
        self.inner.status_callback(request).await
    }
}

/// One-time password delivered over SMS.
///
/// The body ends with the origin-bound line understood by the WebOTP API and
/// Android SMS retriever: `@domain #code`, plus `^app_hash` and
/// `@embedded_host` when set.
#[derive(Clone, Debug, Default)]
pub struct Otp<'a> {
    pub code: &'a str,
    pub domain: &'a str,
    pub app_hash: Option<&'a str>,
    pub embedded_host: Option<&'a str>,
}

impl Otp<'_> {
    /// Render `template`, replacing every `{code}`.
    pub fn body(&self, template: &str) -> String {
        let mut body = template.replace("{code}", self.code).trim_end().to_string();
        body.push_str(&format!("\n\n@{} #{}", self.domain, self.code));
        if let Some(hash) = self.app_hash {
            body.push_str(&format!(" ^{hash}"));
        }
        if let Some(host) = self.embedded_host {
            body.push_str(&format!(" @{host}"));
        }
        body
    }

    /// Send the rendered body to `to` through any endpoint.
    pub async fn send(
        &self,
        endpoint: &dyn Endpoint,
        to: &str,
        template: &str,
    ) -> Result<Option<Message>> {
        let mut fields = Fields::new();
        fields.insert("to".into(), Value::from(to));
        fields.insert("body".into(), Value::from(self.body(template)));
        endpoint.send(fields).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::SendFn;
    use herald_core::{EventBus, Service};
    use serde_json::json;

    fn body_fields(body: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("to".into(), json!("+15550100"));
        fields.insert("body".into(), json!(body));
        fields
    }

    #[tokio::test]
    async fn rejects_bodies_over_the_limit() {
        let mut driver = BodyLimit::new(SendFn::new(|_| Ok(Message::default())));
        assert!(driver.send(&body_fields(&"a".repeat(160))).await.is_ok());

        let err = driver
            .send(&body_fields(&"a".repeat(161)))
            .await
            .unwrap_err();
        assert_eq!(err.body_size(), Some(161));
        assert!(matches!(
            err,
            Error::BodyTooLarge { max_size: 160, service: Some(ref s), .. } if s == "send_function"
        ));
    }

    #[tokio::test]
    async fn counts_characters_not_bytes() {
        let mut driver = BodyLimit::with_max(SendFn::new(|_| Ok(Message::default())), 3);
        assert!(driver.send(&body_fields("héé")).await.is_ok());
    }

    #[test]
    fn otp_body_appends_origin_line() {
        let otp = Otp {
            code: "123456",
            domain: "example.com",
            ..Otp::default()
        };
        assert_eq!(
            otp.body("Your code is {code}.  "),
            "Your code is 123456.\n\n@example.com #123456"
        );

        let otp = Otp {
            app_hash: Some("FA+9qCX9VSu"),
            embedded_host: Some("app.example.com"),
            ..otp
        };
        assert_eq!(
            otp.body("Code: {code}"),
            "Code: 123456\n\n@example.com #123456 ^FA+9qCX9VSu @app.example.com"
        );
    }

    #[tokio::test]
    async fn otp_send_goes_through_the_pipeline() {
        let svc = Service::new(
            "sms",
            BodyLimit::new(SendFn::new(|fields| {
                Ok(Message::default().with_raw(Value::Object(fields.clone())))
            })),
            Arc::new(EventBus::new()),
        );
        let otp = Otp {
            code: "42",
            domain: "example.com",
            ..Otp::default()
        };
        let sent = otp
            .send(&*svc, "+15550100", "{code} is your code")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.raw["body"], "42 is your code\n\n@example.com #42");
    }
}
