//! Source of hypervisor connections. Offloaded connections are leased from
//! a remote broker for the duration of one run.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{BrokerConfig, HypervisorConfig};
use crate::driver::HypervisorConnection;
use crate::error::{Error, Result};

pub trait ConnectionBroker: Send + Sync {
    fn acquire(&self, name: &str, asset_key: &str) -> Result<HypervisorConnection>;
    fn release(&self, conn: &HypervisorConnection) -> Result<()>;
}

/// Hands out the named local connection; nothing to release.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBroker;

impl ConnectionBroker for LocalBroker {
    fn acquire(&self, name: &str, _asset_key: &str) -> Result<HypervisorConnection> {
        Ok(HypervisorConnection::local(name))
    }

    fn release(&self, _conn: &HypervisorConnection) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AcquireRequest<'a> {
    connection: &'a str,
    asset: &'a str,
}

#[derive(Debug, Deserialize)]
struct AcquireResponse {
    lease_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

/// JSON-over-HTTP broker:
/// `POST {base}/v1/verification/connections` leases,
/// `DELETE {base}/v1/verification/connections/{lease_id}` releases.
pub struct HttpBroker {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(cfg: &BrokerConfig) -> Result<Self> {
        let base = cfg
            .resolved_base_url()
            .ok_or_else(|| Error::msg("broker.base_url (or broker.base_url_env) is required when hypervisor.offload is set"))?;
        Self::new(base, cfg.resolved_token(), Duration::from_secs(cfg.timeout_secs))
    }

    fn connections_url(&self) -> String {
        format!("{}/v1/verification/connections", self.base_url)
    }
}

impl ConnectionBroker for HttpBroker {
    fn acquire(&self, name: &str, asset_key: &str) -> Result<HypervisorConnection> {
        let mut req = self.client.post(self.connections_url()).json(&AcquireRequest {
            connection: name,
            asset: asset_key,
        });
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("broker acquire failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "broker acquire failed with status {}",
                res.status()
            )));
        }
        let body: AcquireResponse = res
            .json()
            .map_err(|e| Error::msg(format!("broker acquire JSON parse failed: {e}")))?;
        tracing::info!(connection = name, lease = %body.lease_id, "leased hypervisor connection");
        Ok(HypervisorConnection {
            name: body.name.unwrap_or_else(|| name.to_string()),
            address: body.address,
            brokered: true,
            lease_id: Some(body.lease_id),
        })
    }

    fn release(&self, conn: &HypervisorConnection) -> Result<()> {
        let Some(lease) = conn.lease_id.as_deref() else {
            return Ok(());
        };
        let url = format!("{}/{lease}", self.connections_url());
        let mut req = self.client.delete(url);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("broker release failed: {e}")))?;
        // An unknown lease is already gone.
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(lease, "released hypervisor connection");
            return Ok(());
        }
        Err(Error::msg(format!(
            "broker release failed with status {}",
            res.status()
        )))
    }
}

pub fn from_config(hv: &HypervisorConfig, cfg: &BrokerConfig) -> Result<Arc<dyn ConnectionBroker>> {
    if hv.offload {
        Ok(Arc::new(HttpBroker::from_config(cfg)?))
    } else {
        Ok(Arc::new(LocalBroker))
    }
}

/// A connection for one run; brokered connections are released on drop.
pub struct ConnectionLease {
    broker: Arc<dyn ConnectionBroker>,
    conn: HypervisorConnection,
    released: bool,
}

impl ConnectionLease {
    pub fn acquire(broker: Arc<dyn ConnectionBroker>, name: &str, asset_key: &str) -> Result<Self> {
        let conn = broker.acquire(name, asset_key)?;
        Ok(Self {
            broker,
            conn,
            released: false,
        })
    }

    pub fn connection(&self) -> &HypervisorConnection {
        &self.conn
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if self.conn.brokered {
            self.broker.release(&self.conn)?;
        }
        Ok(())
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released || !self.conn.brokered {
            return;
        }
        if let Err(e) = self.broker.release(&self.conn) {
            tracing::warn!(connection = %self.conn.name, error = %e, "failed to release brokered connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct CountingBroker {
        released: Mutex<Vec<String>>,
    }

    impl ConnectionBroker for CountingBroker {
        fn acquire(&self, name: &str, _asset_key: &str) -> Result<HypervisorConnection> {
            Ok(HypervisorConnection {
                name: name.to_string(),
                address: None,
                brokered: true,
                lease_id: Some("lease-1".into()),
            })
        }

        fn release(&self, conn: &HypervisorConnection) -> Result<()> {
            self.released
                .lock()
                .expect("lock")
                .push(conn.lease_id.clone().unwrap_or_default());
            Ok(())
        }
    }

    #[test]
    fn brokered_lease_is_released_once_on_drop() {
        let broker = Arc::new(CountingBroker::default());
        {
            let lease = ConnectionLease::acquire(broker.clone(), "hv", "agent-1").expect("acquire");
            assert!(lease.connection().brokered);
        }
        assert_eq!(*broker.released.lock().expect("lock"), vec!["lease-1".to_string()]);

        let lease = ConnectionLease::acquire(broker.clone(), "hv", "agent-1").expect("acquire");
        lease.release().expect("release");
        assert_eq!(broker.released.lock().expect("lock").len(), 2);
    }

    #[test]
    fn local_connections_need_no_release() {
        let lease = ConnectionLease::acquire(Arc::new(LocalBroker), "local", "agent-1").expect("acquire");
        assert!(!lease.connection().brokered);
    }
}
