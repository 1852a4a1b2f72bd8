pub mod middleware;
pub mod payment_task;
pub mod publish_task;
pub mod reconcile_task;
pub mod rest;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the handlers the binary wires into the router.
pub use middleware::require_experimenter;
pub use payment_task::{pay_handler, reject_handler};
pub use publish_task::{expire_handler, publish_handler};
pub use reconcile_task::payments_handler;
pub use rest::{
    completion_url_handler, import_session_handler, redirect_handler, session_status_handler,
};
