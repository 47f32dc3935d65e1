//! Boundary towards the UI collaborator: a request/response accessor for the
//! current endpoint plus one outbound event stream.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::network::{NetworkInfo, PortMap};
use crate::publisher::{EndpointPublisher, EndpointSource, PublishedEndpoint, SubscriptionId};
use crate::tunnel::{LogLine, TunnelOutput};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    EndpointUpdated {
        url: String,
        is_public: bool,
        source: EndpointSource,
    },
    TunnelLog(LogLine),
    UrlFound {
        url: String,
        full_log: String,
        timestamp: DateTime<Utc>,
    },
}

impl From<PublishedEndpoint> for UiEvent {
    fn from(endpoint: PublishedEndpoint) -> Self {
        Self::EndpointUpdated {
            url: endpoint.url,
            is_public: endpoint.is_public,
            source: endpoint.source,
        }
    }
}

impl From<TunnelOutput> for UiEvent {
    fn from(output: TunnelOutput) -> Self {
        match output {
            TunnelOutput::Log(line) => Self::TunnelLog(line),
            TunnelOutput::UrlFound {
                url,
                full_log,
                timestamp,
            } => Self::UrlFound {
                url,
                full_log,
                timestamp,
            },
        }
    }
}

pub struct UiBridge {
    publisher: Arc<EndpointPublisher>,
    network_ip: String,
    ports: PortMap,
    events: broadcast::Sender<UiEvent>,
    subscription: SubscriptionId,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl UiBridge {
    pub fn attach(publisher: Arc<EndpointPublisher>, network_ip: String, ports: PortMap) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sink = events.clone();
        let subscription = publisher.subscribe(move |endpoint| {
            let _ = sink.send(UiEvent::from(endpoint));
        });
        Self {
            publisher,
            network_ip,
            ports,
            events,
            subscription,
            forwarder: Mutex::new(None),
        }
    }

    /// Relays tunnel diagnostics onto the UI event stream until the source
    /// closes. Must be called inside a tokio runtime.
    pub fn forward_diagnostics(&self, mut source: broadcast::Receiver<TunnelOutput>) {
        let sink = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(output) => {
                        let _ = sink.send(UiEvent::from(output));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = forwarder.replace(task) {
            previous.abort();
        }
    }

    pub fn events(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn current(&self) -> PublishedEndpoint {
        self.publisher.current()
    }

    pub fn tunnel_url(&self) -> Option<String> {
        self.network_info().tunnel_url
    }

    pub fn network_info(&self) -> NetworkInfo {
        NetworkInfo::from_endpoint(
            &self.publisher.current(),
            self.network_ip.clone(),
            self.ports.clone(),
        )
    }
}

impl Drop for UiBridge {
    fn drop(&mut self) {
        self.publisher.unsubscribe(self.subscription);
        let forwarder = self
            .forwarder
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = forwarder.take() {
            task.abort();
        }
    }
}
