//! Bus-side globals registered into the suspendable template environment.
//!
//! Templates run on a blocking thread (see [`super::TemplateEngine`]); each
//! call here posts a request over a channel and blocks on the reply,
//! mirroring the oneshot round-trips the teacher crate uses to cross from a
//! blocking caller back into the event loop.

use futures::channel::oneshot;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind};

/// A request one of the `dbus_*` template globals sends to whatever owns
/// the bus connection.
pub enum BusFunctionRequest {
    List { name_pattern: String, reply: oneshot::Sender<Result<Vec<String>, Error>> },
    Call {
        bus_name: String,
        path: String,
        interface: String,
        method: String,
        args: Json,
        reply: oneshot::Sender<Result<Json, Error>>,
    },
    PropertyGet {
        bus_name: String,
        path: String,
        interface: String,
        property: String,
        default_if_unsupported: Json,
        reply: oneshot::Sender<Result<Json, Error>>,
    },
}

/// Handle cloned into the template engine; each method blocks the calling
/// (blocking-pool) thread until the reply arrives.
#[derive(Clone)]
pub struct BusFunctionsHandle {
    tx: mpsc::Sender<BusFunctionRequest>,
}

impl BusFunctionsHandle {
    pub fn new(tx: mpsc::Sender<BusFunctionRequest>) -> Self {
        Self { tx }
    }

    fn dispatch<T>(
        &self, build: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> BusFunctionRequest,
    ) -> Result<T, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(build(reply_tx))
            .map_err(|_| Error::with_message(ErrorKind::Internal("bus worker gone".into()), ""))?;
        futures::executor::block_on(reply_rx)
            .map_err(|_| Error::with_message(ErrorKind::Internal("bus worker dropped reply".into()), ""))?
    }

    pub fn list(&self, name_pattern: String) -> Result<Vec<String>, Error> {
        self.dispatch(|reply| BusFunctionRequest::List { name_pattern, reply })
    }

    pub fn call(&self, bus_name: String, path: String, interface: String, method: String, args: Json) -> Result<Json, Error> {
        self.dispatch(|reply| BusFunctionRequest::Call { bus_name, path, interface, method, args, reply })
    }

    pub fn property_get(
        &self, bus_name: String, path: String, interface: String, property: String, default_if_unsupported: Json,
    ) -> Result<Json, Error> {
        self.dispatch(|reply| {
            BusFunctionRequest::PropertyGet { bus_name, path, interface, property, default_if_unsupported, reply }
        })
    }
}
