mod batch;
mod context;
mod event;
mod request;
mod request_table;
mod server;
mod shared;

pub use batch::*;
pub use context::*;
pub(crate) use event::*;
pub use request::*;
pub(crate) use request_table::*;
pub use server::*;
pub(crate) use shared::*;
