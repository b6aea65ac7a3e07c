//! Pick a usable client from several server addresses.
//!
//! Addresses are shuffled once so that separate processes spread their
//! first choice. A client that answers stays at the front of the list and is
//! handed out until its connection goes away.

use crate::client::{Client, DialOptions};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Default time allowed for a first connection to each address
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Channel construction errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    NoAddresses,
    EmptyAddress,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::NoAddresses => write!(f, "address list cannot be empty"),
            ChannelError::EmptyAddress => write!(f, "addresses must not be empty"),
        }
    }
}

impl std::error::Error for ChannelError {}

struct NamedClient {
    addr: String,
    client: Option<Arc<Client>>,
}

/// Set of clients, one per address, created on demand
pub struct MultiAddrChannel {
    clients: Mutex<Vec<NamedClient>>,
    options: DialOptions,
    connect_timeout: Duration,
}

impl MultiAddrChannel {
    pub fn new(
        addrs: &[String],
        options: DialOptions,
        connect_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        if addrs.is_empty() {
            return Err(ChannelError::NoAddresses);
        }
        if addrs.iter().any(|addr| addr.is_empty()) {
            return Err(ChannelError::EmptyAddress);
        }

        let mut clients: Vec<NamedClient> = addrs
            .iter()
            .map(|addr| NamedClient {
                addr: addr.clone(),
                client: None,
            })
            .collect();
        clients.shuffle(&mut rand::thread_rng());

        Ok(MultiAddrChannel {
            clients: Mutex::new(clients),
            // Connections are made here, never while dialing
            options: DialOptions {
                with_block: false,
                ..options
            },
            connect_timeout,
        })
    }

    /// Current address order.
    pub async fn addrs(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        clients.iter().map(|named| named.addr.clone()).collect()
    }

    /// Return a connected client, or a random one if none is ready.
    pub async fn get(&self) -> Arc<Client> {
        let mut clients = self.clients.lock().await;

        for i in 0..clients.len() {
            match clients[i].client.clone() {
                Some(client) => {
                    if client.is_ready() {
                        if i != 0 {
                            debug!(index = i, addr = %clients[i].addr, "Moving ready client to front");
                            clients.swap(0, i);
                        }
                        return client;
                    }

                    debug!(index = i, addr = %clients[i].addr, "Skipping client that is not ready");
                    let reconnect = Arc::clone(&client);
                    tokio::spawn(async move {
                        let _ = reconnect.connect().await;
                    });
                }
                None => {
                    let named = &mut clients[i];
                    debug!(index = i, addr = %named.addr, "Connecting");
                    let client = Arc::new(Client::new(&named.addr, self.options.clone()));
                    named.client = Some(Arc::clone(&client));

                    match tokio::time::timeout(self.connect_timeout, client.connect()).await {
                        Ok(Ok(())) => return client,
                        Ok(Err(e)) => {
                            debug!(index = i, addr = %named.addr, error = %e, "Failed to connect")
                        }
                        Err(_) => debug!(
                            index = i,
                            addr = %named.addr,
                            timeout_ms = self.connect_timeout.as_millis() as u64,
                            "Failed to connect in time"
                        ),
                    }
                }
            }
        }

        // Nothing is ready; pick any client and let the call retry the dial
        let index = rand::thread_rng().gen_range(0..clients.len());
        let named = &mut clients[index];
        let options = &self.options;
        Arc::clone(
            named
                .client
                .get_or_insert_with(|| Arc::new(Client::new(&named.addr, options.clone()))),
        )
    }

    /// Close every client that was created.
    pub async fn close(&self) {
        let clients = self.clients.lock().await;
        for named in clients.iter() {
            if let Some(client) = &named.client {
                if let Err(e) = client.close().await {
                    debug!(addr = %named.addr, error = %e, "Error closing client");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::spawn_test_server;
    use crate::status::Code;

    async fn closed_addr() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn test_rejects_bad_address_lists() {
        let options = DialOptions::default();
        assert_eq!(
            MultiAddrChannel::new(&[], options.clone(), DEFAULT_CONNECT_TIMEOUT).err(),
            Some(ChannelError::NoAddresses)
        );
        assert_eq!(
            MultiAddrChannel::new(
                &["127.0.0.1:1".to_string(), String::new()],
                options,
                DEFAULT_CONNECT_TIMEOUT
            )
            .err(),
            Some(ChannelError::EmptyAddress)
        );
    }

    #[tokio::test]
    async fn test_shuffle_keeps_addresses() {
        let addrs: Vec<String> = (1..=8).map(|port| format!("127.0.0.1:{}", port)).collect();
        let channel =
            MultiAddrChannel::new(&addrs, DialOptions::default(), DEFAULT_CONNECT_TIMEOUT).unwrap();

        let mut order = channel.addrs().await;
        order.sort();
        let mut expected = addrs.clone();
        expected.sort();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_get_prefers_live_server() {
        let live = spawn_test_server(1024);
        let dead = closed_addr().await;
        let channel = MultiAddrChannel::new(
            &[dead.clone(), live.clone()],
            DialOptions::default(),
            Duration::from_secs(1),
        )
        .unwrap();

        let client = channel.get().await;
        assert_eq!(client.addr(), live);

        let status = client.call("errLength=1").await.unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "t");

        // The ready client moves to the front and keeps being chosen
        let again = channel.get().await;
        assert!(Arc::ptr_eq(&client, &again));
        assert_eq!(channel.addrs().await[0], live);

        channel.close().await;
    }

    #[tokio::test]
    async fn test_get_falls_back_when_nothing_is_ready() {
        let dead = closed_addr().await;
        let channel =
            MultiAddrChannel::new(&[dead.clone()], DialOptions::default(), Duration::from_secs(1))
                .unwrap();

        let client = channel.get().await;
        assert_eq!(client.addr(), dead);
        assert!(!client.is_ready());

        let status = client.call("errLength=1").await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
