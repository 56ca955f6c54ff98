//! Configuration and inspection interface for tunnel devices.
//!
//! All setters serialize against up transitions through the device's IPC
//! lock, so a peer created by an in-progress configuration is always started
//! before an up transition completes.

use std::net::SocketAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use x25519_dalek::PublicKey;

use crate::device::{Device, DeviceState, DeviceTransports, Error, ObfuscationConfig, Peer};
use crate::x25519;

/// A [`Peer`] with its connection statistics.
#[derive(Debug)]
#[non_exhaustive]
pub struct PeerStats {
    /// The peer configuration.
    pub peer: Peer,
    /// Time elapsed since the last completed handshake with this peer.
    pub last_handshake: Option<Duration>,
    /// Total number of bytes sent to this peer.
    pub tx_bytes: u64,
    /// Total number of bytes received from this peer.
    pub rx_bytes: u64,
}

impl<T: DeviceTransports> Device<T> {
    /// Bring the device up.
    ///
    /// Rebinds the UDP transport, spawns its receive tasks, and starts every
    /// peer. If any step fails the device is driven back down and
    /// [`Error::UpFailed`] carries both errors. A no-op on a closed device.
    pub async fn up(&self) -> Result<(), Error> {
        self.inner.up().await
    }

    /// Bring the device down: close the bind and stop every peer.
    ///
    /// A no-op on a closed device.
    pub async fn down(&self) -> Result<(), Error> {
        self.inner.down().await
    }

    /// Close the device and release every worker. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Resolve once the device has fully closed.
    pub async fn wait(&self) {
        self.inner.wait().await
    }

    /// The device's lifecycle state. Advisory: it may change underneath the
    /// caller at any time.
    pub fn state(&self) -> DeviceState {
        self.inner.device_state()
    }

    /// Whether the device is (or recently was) under handshake load.
    pub fn is_under_load(&self) -> bool {
        self.inner.is_under_load()
    }

    /// Install a new private key. See the type-level docs for the
    /// invalidation this implies. Setting the same key is a no-op.
    pub async fn set_private_key(&self, private_key: x25519::StaticSecret) -> Result<(), Error> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let _ipc = self.inner.ipc_lock.lock().await;
        self.inner.set_private_key(private_key).await;
        Ok(())
    }

    /// The device's public key, if a private key has been configured.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.inner.identity.read().public
    }

    /// Add a single new peer.
    ///
    /// Returns `false` if a peer with the same public key already exists.
    pub async fn add_peer(&self, peer: Peer) -> Result<bool, Error> {
        self.inner.add_peer(peer).await
    }

    /// Add multiple new peers. Stops at the first failure.
    pub async fn add_peers(&self, peers: impl IntoIterator<Item = Peer>) -> Result<(), Error> {
        for peer in peers {
            self.inner.add_peer(peer).await?;
        }
        Ok(())
    }

    /// Remove a single peer, detaching all its allowed IPs first.
    ///
    /// Returns `false` if no peer with `public_key` exists.
    pub async fn remove_peer(&self, public_key: &PublicKey) -> bool {
        self.inner.remove_peer(public_key).await
    }

    /// Remove all peers, returning the number of peers removed.
    pub async fn clear_peers(&self) -> usize {
        let _ipc = self.inner.ipc_lock.lock().await;
        let n = self.inner.peers.read().by_key.len();
        self.inner.remove_all_peers().await;
        n
    }

    /// Change the configured listen port, rebinding if the device is up.
    pub async fn set_listen_port(&self, port: u16) -> Result<(), Error> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let _ipc = self.inner.ipc_lock.lock().await;
        self.inner.set_port(port).await
    }

    /// The port the current bind is listening on, or `0` while down.
    pub async fn listen_port(&self) -> u16 {
        self.inner.listen_port().await
    }

    /// Set the firewall mark on the UDP transport.
    pub async fn set_fwmark(&self, fwmark: u32) -> Result<(), Error> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let _ipc = self.inner.ipc_lock.lock().await;
        self.inner.set_fwmark(fwmark).await
    }

    /// Validate and install an obfuscation configuration.
    ///
    /// On any validation failure nothing is installed and the previous
    /// configuration stays live; the returned [`Error::ConfigInvalid`] names
    /// every fault. See [`ObfuscationConfig`].
    pub async fn set_obfuscation_config(&self, config: &ObfuscationConfig) -> Result<(), Error> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let _ipc = self.inner.ipc_lock.lock().await;
        self.inner.obfuscation.handle_post_config(config)
    }

    /// Whether a non-default obfuscation configuration is active.
    pub fn is_obfuscation_on(&self) -> bool {
        self.inner.obfuscation.is_enabled()
    }

    /// The device MTU. Updated by `MtuUpdate` interface events.
    pub fn mtu(&self) -> u16 {
        self.inner.mtu()
    }

    /// The batch size for the device as a whole: the max of the bind batch
    /// size and the IP transport batch size.
    pub fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    /// A snapshot of every configured peer with its statistics.
    pub fn peers(&self) -> Vec<PeerStats> {
        let registry = self.inner.peers.read();
        registry
            .by_key
            .values()
            .map(|peer| {
                let allowed_ips: Vec<IpNetwork> = peer.allowed_ips.lock().clone();
                let endpoint: Option<SocketAddr> = peer.endpoint();
                PeerStats {
                    peer: Peer {
                        public_key: peer.public_key,
                        endpoint,
                        allowed_ips,
                        preshared_key: None,
                        keepalive: match peer.persistent_keepalive() {
                            0 => None,
                            n => Some(n as u16),
                        },
                    },
                    last_handshake: peer.last_handshake().map(|at| at.elapsed()),
                    tx_bytes: peer.tx_bytes(),
                    rx_bytes: peer.rx_bytes(),
                }
            })
            .collect()
    }
}
