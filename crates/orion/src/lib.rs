pub mod agent;
pub mod bridge;
pub mod cancel;
pub mod diagnostics;
pub mod errors;
pub mod models;
pub mod providers;
pub mod sse;
pub mod stream;
pub mod tools;
