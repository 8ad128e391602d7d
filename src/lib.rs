pub mod config;
pub mod domain {
    pub mod error;
    pub mod events;
    pub mod ids;
    pub mod money;
    pub mod order;
    pub mod refund;
}
pub mod gateways;
pub mod http {
    pub mod api;
    pub mod handlers {
        pub mod callbacks;
        pub mod orders;
        pub mod stats;
    }
    pub mod middleware {
        pub mod admin_auth;
        pub mod rate_limit;
    }
}
pub mod repo {
    pub mod memory;
    pub mod outbox_repo;
    pub mod pg;
    pub mod store;
}
pub mod service {
    pub mod order_service;
    pub mod outbox_relay;
    pub mod reconciler;
    pub mod risk;
    pub mod status_sync;
}

#[derive(Clone)]
pub struct AppState {
    pub order_service: service::order_service::OrderService,
    pub reconciler: service::reconciler::Reconciler,
    pub selector: std::sync::Arc<gateways::selector::GatewaySelector>,
}
