pub mod dispatch;
pub mod server;
pub mod session;

pub use dispatch::QueryHandler;
pub use server::Server;
pub use session::{Session, SessionRegistry, SessionState};
