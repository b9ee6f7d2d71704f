//! Message and query routing
//!
//! Each message type identifier belongs to exactly one module; each query
//! route to exactly one module. Both tables are fixed at startup and a
//! duplicate registration is a wiring error.

use crate::{Error, Result};
use chain_modules::{AppModule, Msg};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Message type identifier to handling module
#[derive(Default, Clone)]
pub struct Router {
    routes: BTreeMap<&'static str, Arc<dyn AppModule>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(url, m)| (url, m.name())))
            .finish()
    }
}

impl Router {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every message type the module declares
    pub fn add_module(&mut self, module: Arc<dyn AppModule>) -> Result<()> {
        for type_url in module.message_types() {
            if let Some(existing) = self.routes.get(type_url) {
                return Err(Error::Wiring(format!(
                    "message type {} registered by both {} and {}",
                    type_url,
                    existing.name(),
                    module.name()
                )));
            }
            self.routes.insert(type_url, Arc::clone(&module));
        }
        Ok(())
    }

    /// Module handling `msg`
    pub fn route(&self, msg: &Msg) -> chain_modules::Result<&Arc<dyn AppModule>> {
        self.routes.get(msg.type_url()).ok_or_else(|| {
            chain_modules::Error::UnknownRequest(format!("unrecognized message type: {}", msg.type_url()))
        })
    }

    /// Registered type identifiers
    pub fn type_urls(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }
}

/// Query route to answering module
#[derive(Default, Clone)]
pub struct QueryRouter {
    routes: BTreeMap<&'static str, Arc<dyn AppModule>>,
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.routes.keys()).finish()
    }
}

impl QueryRouter {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module's query route, if it has one
    pub fn add_module(&mut self, module: Arc<dyn AppModule>) -> Result<()> {
        let Some(route) = module.query_route() else {
            return Ok(());
        };
        if self.routes.contains_key(route) {
            return Err(Error::Wiring(format!("query route {} registered twice", route)));
        }
        self.routes.insert(route, module);
        Ok(())
    }

    /// Module serving `route`
    pub fn route(&self, route: &str) -> Option<&Arc<dyn AppModule>> {
        self.routes.get(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_modules::{
        abci::ValidatorUpdate, bank::MsgSend, Coins, DeliverGenesisTx, MsgDefinition,
    };
    use chain_store::Context;
    use serde_json::Value;

    struct Fake(&'static str, &'static [&'static str]);

    impl AppModule for Fake {
        fn name(&self) -> &'static str {
            self.0
        }
        fn default_genesis(&self) -> Value {
            Value::Null
        }
        fn validate_genesis(&self, _genesis: &Value) -> chain_modules::Result<()> {
            Ok(())
        }
        fn init_genesis(
            &self,
            _ctx: &mut Context<'_>,
            _genesis: &Value,
            _txs: &dyn DeliverGenesisTx,
        ) -> chain_modules::Result<Vec<ValidatorUpdate>> {
            Ok(Vec::new())
        }
        fn export_genesis(&self, _ctx: &mut Context<'_>) -> chain_modules::Result<Value> {
            Ok(Value::Null)
        }
        fn message_types(&self) -> &'static [&'static str] {
            self.1
        }
        fn query_route(&self) -> Option<&'static str> {
            Some(self.0)
        }
    }

    #[test]
    fn test_duplicate_message_route_fatal() {
        let mut router = Router::new();
        router.add_module(Arc::new(Fake("bank", &[MsgSend::TYPE_URL]))).unwrap();
        let err = router
            .add_module(Arc::new(Fake("other", &[MsgSend::TYPE_URL])))
            .unwrap_err();
        assert!(matches!(err, Error::Wiring(_)));
    }

    #[test]
    fn test_route_by_type_url() {
        let mut router = Router::new();
        router.add_module(Arc::new(Fake("bank", &[MsgSend::TYPE_URL]))).unwrap();
        let msg = Msg::Send(MsgSend {
            from_address: Default::default(),
            to_address: Default::default(),
            amount: Coins::empty(),
        });
        assert_eq!(router.route(&msg).unwrap().name(), "bank");

        let unrouted = Router::new();
        assert_eq!(unrouted.route(&msg).err().map(|e| e.code()), Some(6));
    }

    #[test]
    fn test_duplicate_query_route_fatal() {
        let mut router = QueryRouter::new();
        router.add_module(Arc::new(Fake("bank", &[]))).unwrap();
        assert!(router.add_module(Arc::new(Fake("bank", &[]))).is_err());
        assert!(router.route("bank").is_some());
        assert!(router.route("mint").is_none());
    }
}
