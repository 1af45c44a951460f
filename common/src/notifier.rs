use log::{info, warn};

use crate::{
    broker::{BrokerConnectionManager, BrokerTransport, PublishError},
    types::NotificationEvent,
};

/// Destination for door events on the broker side.
pub trait EventSink {
    fn publish_event(&mut self, payload: &str) -> Result<(), PublishError>;
}

impl<T: BrokerTransport> EventSink for BrokerConnectionManager<T> {
    fn publish_event(&mut self, payload: &str) -> Result<(), PublishError> {
        self.publish(payload.as_bytes())
    }
}

/// Writes the event to the console and publishes it. A failed publish is
/// logged and dropped. Returns the payload that was emitted.
pub fn notify<E: EventSink + ?Sized>(sink: &mut E, event: NotificationEvent) -> String {
    let payload = event.payload();
    info!("{payload}");
    if let Err(err) = sink.publish_event(&payload) {
        warn!("failed to publish `{payload}`: {err}");
    }
    payload
}
