use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context};
use bytes::{Buf, BytesMut};
use mavlink::{ardupilotmega as apm, MavHeader, MavlinkVersion};
use tokio::net::UdpSocket;

/// Our own MAVLink identity, a ground control station.
const GCS_SYSTEM_ID: u8 = 255;
const GCS_COMPONENT_ID: u8 = 190;

pub fn parse_version(version: &str) -> anyhow::Result<MavlinkVersion> {
    Ok(match version {
        "V1" => MavlinkVersion::V1,
        "V2" => MavlinkVersion::V2,
        other => bail!("invalid mavlink version {other}"),
    })
}

/// Sending half of a MAVLink link over UDP.
pub struct PixhawkInterface {
    sock: Arc<UdpSocket>,
    sequence: AtomicU8,
    version: MavlinkVersion,
}

/// Receiving half of a MAVLink link over UDP.
pub struct PixhawkReader {
    sock: Arc<UdpSocket>,
    buf: BytesMut,
    version: MavlinkVersion,
}

impl PixhawkInterface {
    /// Binds `addr` and locks onto the first peer that sends us a packet.
    pub async fn connect(
        addr: SocketAddr,
        version: MavlinkVersion,
    ) -> anyhow::Result<(PixhawkInterface, PixhawkReader)> {
        let sock = UdpSocket::bind(addr)
            .await
            .context("failed to bind pixhawk socket")?;

        debug!("waiting for packet from autopilot on {addr}");

        let mut first = vec![0; 1024];
        let (n, remote_addr) = sock
            .recv_from(&mut first[..])
            .await
            .context("error retrieving packet from autopilot")?;

        info!(
            "received packet from {:?}, locking to this address",
            remote_addr
        );

        sock.connect(remote_addr)
            .await
            .context("failed to lock to address")?;

        match version {
            MavlinkVersion::V1 => debug!("using mavlink v1"),
            MavlinkVersion::V2 => debug!("using mavlink v2"),
        };

        let sock = Arc::new(sock);
        let mut buf = BytesMut::with_capacity(4096);
        buf.extend_from_slice(&first[..n]);

        Ok((
            PixhawkInterface {
                sock: sock.clone(),
                sequence: AtomicU8::default(),
                version,
            },
            PixhawkReader { sock, buf, version },
        ))
    }

    /// Sends a message to the autopilot.
    pub async fn send(&self, message: &apm::MavMessage) -> anyhow::Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        trace!("sending message: {:?}", message);

        let header = MavHeader {
            sequence,
            system_id: GCS_SYSTEM_ID,
            component_id: GCS_COMPONENT_ID,
        };

        let mut buf = Vec::with_capacity(280);

        mavlink::write_versioned_msg(&mut buf, self.version, header, message)?;
        self.sock.send(buf.as_ref()).await?;

        Ok(())
    }
}

impl PixhawkReader {
    async fn fill(&mut self) -> anyhow::Result<()> {
        let mut chunk = vec![0; 1024];
        let n = self.sock.recv(&mut chunk[..]).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        trace!("read {:?} bytes", n);
        Ok(())
    }

    /// Waits for the next well-formed message on the link, along with the
    /// header naming its sender. Frames that fail to parse are dropped.
    pub async fn recv(&mut self) -> anyhow::Result<(MavHeader, apm::MavMessage)> {
        let magic = match self.version {
            MavlinkVersion::V1 => 0xFE,
            MavlinkVersion::V2 => 0xFD,
        };

        loop {
            let magic_position = loop {
                let magic_position = self.buf.iter().position(|&b| b == magic);

                match magic_position {
                    // we need at least two bytes after the magic in the buffer
                    Some(magic_position) if magic_position + 2 < self.buf.len() => {
                        break magic_position
                    }
                    Some(_) => self.fill().await?,
                    None => {
                        // nothing useful buffered
                        self.buf.clear();
                        self.fill().await?;
                    }
                };
            };

            let payload_len = self.buf[magic_position + 1] as usize;

            let frame_len = match self.version {
                // in v1: 1 byte magic + 1 byte payload len + 4 byte header + 2 byte checksum
                MavlinkVersion::V1 => payload_len + 8,
                // in v2: 1 byte magic + 1 byte payload len + 8 byte header + 2 byte checksum,
                // plus a 13 byte signature if the signed flag is set
                MavlinkVersion::V2 => {
                    let incompat_flags = self.buf[magic_position + 2];
                    payload_len + 12 + if incompat_flags & 0x01 != 0 { 13 } else { 0 }
                }
            };

            while magic_position + frame_len > self.buf.len() {
                trace!("requesting more bytes, buffer insufficient");
                self.fill().await?;
            }

            let frame = &self.buf[magic_position..magic_position + frame_len];

            match mavlink::read_versioned_msg(&mut &frame[..], self.version) {
                Ok((header, msg)) => {
                    self.buf.advance(magic_position + frame_len);
                    trace!(
                        "received message from {}/{}: {:?}",
                        header.system_id,
                        header.component_id,
                        msg
                    );
                    return Ok((header, msg));
                }
                Err(err) => {
                    debug!("dropping unparseable frame ({:?}): {:02x?}", err, frame);
                    // the magic byte may have been payload, resync just past it
                    self.buf.advance(magic_position + 1);
                }
            }
        }
    }
}
