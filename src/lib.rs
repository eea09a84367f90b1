pub mod auth;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;
pub mod state;
pub mod store;

pub use gateway::Gateway;
pub use routes::create_router;
pub use state::AppState;
