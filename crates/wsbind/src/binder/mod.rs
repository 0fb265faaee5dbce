pub mod local;
pub mod remote;

pub use local::{LocalBinder, Methods};
pub use remote::RemoteBinder;

use std::sync::Arc;

use crate::connection::Connection;

/// Either side of a binding. Both variants carry a back-reference to
/// the connection they were installed on.
#[derive(Clone)]
pub enum Binder {
    Local(Arc<LocalBinder>),
    Remote(Arc<RemoteBinder>),
}

impl Binder {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Binder::Local(binder) => binder.connection(),
            Binder::Remote(binder) => binder.connection(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Binder::Local(_))
    }
}
