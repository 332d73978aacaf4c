pub mod dispatcher;
pub mod ledger;
pub mod reporter;
pub mod route_cache;
