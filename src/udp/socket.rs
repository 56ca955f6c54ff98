// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The default [`UdpTransportFactory`], backed by [`tokio::net::UdpSocket`].
//!
//! Binds one dual-family pair of sockets per device: an IPv4 socket and, when
//! available, an IPv6 socket on the same port. Each becomes one receiver.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketBufPool};
use crate::udp::{UdpRecv, UdpSend, UdpTransportFactory, UdpTransportParams};

/// Binds plain UDP sockets. This is the conventional transport.
pub struct UdpSocketFactory;

/// Send half of [`UdpSocketFactory`]'s transport.
#[derive(Clone)]
pub struct UdpSocketTx {
    v4: Arc<UdpSocket>,
    v6: Option<Arc<UdpSocket>>,
}

/// One receiver of [`UdpSocketFactory`]'s transport.
pub struct UdpSocketRx {
    socket: Arc<UdpSocket>,
}

impl UdpTransportFactory for UdpSocketFactory {
    type Send = UdpSocketTx;
    type Recv = UdpSocketRx;

    async fn bind(
        &mut self,
        params: &UdpTransportParams,
    ) -> io::Result<(Self::Send, Vec<Self::Recv>, u16)> {
        let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, params.port)).await?;
        let port = v4.local_addr()?.port();
        let v4 = Arc::new(v4);

        // Listen on the same port for IPv6. Not fatal if the host has no v6.
        let v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                log::warn!("Not listening on IPv6: {e}");
                None
            }
        };

        let tx = UdpSocketTx {
            v4: Arc::clone(&v4),
            v6: v6.clone(),
        };

        if let Some(fwmark) = params.fwmark {
            tx.set_fwmark(fwmark)?;
        }

        let mut receivers = vec![UdpSocketRx { socket: v4 }];
        if let Some(v6) = v6 {
            receivers.push(UdpSocketRx { socket: v6 });
        }

        Ok((tx, receivers, port))
    }
}

#[cfg(target_os = "linux")]
fn set_mark(socket: &UdpSocket, mark: u32) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const libc::c_void,
            size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl UdpSend for UdpSocketTx {
    async fn send_to(&self, packet: Packet, destination: SocketAddr) -> io::Result<()> {
        let socket = match destination {
            SocketAddr::V4(_) => &self.v4,
            SocketAddr::V6(_) => self
                .v6
                .as_ref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?,
        };
        socket.send_to(&packet, destination).await?;
        Ok(())
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.v4.local_addr()?.port())
    }

    #[cfg(target_os = "linux")]
    fn set_fwmark(&self, mark: u32) -> io::Result<()> {
        set_mark(&self.v4, mark)?;
        if let Some(v6) = &self.v6 {
            set_mark(v6, mark)?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_fwmark(&self, _mark: u32) -> io::Result<()> {
        Ok(())
    }
}

impl UdpRecv for UdpSocketRx {
    async fn recv_from(&mut self, pool: &mut PacketBufPool) -> io::Result<(Packet, SocketAddr)> {
        let mut packet = pool.get().await;
        let (len, addr) = self.socket.recv_from(packet.buf_mut()).await?;
        packet.truncate(len);
        Ok((packet, addr))
    }
}
