//! Kind string -> driver factory lookup used by config-driven setup.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    messaging::types::Fields,
    ports::{Configurable, Driver},
    Error, Result,
};

type Factory = Arc<dyn Fn(Fields) -> Result<Box<dyn Driver>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: BTreeMap<String, Factory>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `D` under its own `NAME`.
    pub fn register<D: Configurable>(&mut self) -> &mut Self {
        self.register_with(D::NAME, |options| {
            D::from_options(options).map(|d| Box::new(d) as Box<dyn Driver>)
        })
    }

    /// Register a custom factory, replacing any previous one for `kind`.
    pub fn register_with<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(Fields) -> Result<Box<dyn Driver>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, kind: &str, options: Fields) -> Result<Box<dyn Driver>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::config(format!("unknown driver kind '{kind}'")))?;
        factory(options)
    }
}

impl fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}
