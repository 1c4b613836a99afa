//! Minimal read-only NBD client for the export sockets.
//!
//! Only what a local nbdkit export needs: fixed-newstyle handshake with
//! `NBD_OPT_GO`, simple replies, `NBD_CMD_READ` and `NBD_CMD_DISC`.

use crate::export::ExportReader;
use crate::{MigrateError, Result, log_debug};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

pub const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
pub const OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

pub const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const FLAG_NO_ZEROES: u16 = 1 << 1;

pub const OPT_GO: u32 = 7;
pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_FLAG_ERROR: u32 = 1 << 31;
pub const INFO_EXPORT: u16 = 0;

pub const CMD_READ: u16 = 0;
pub const CMD_DISC: u16 = 2;

/// Largest single read request sent to the server.
pub const MAX_REQUEST: usize = 32 * 1024 * 1024;

const MAX_OPTION_REPLY: u32 = 64 * 1024;

pub struct NbdClient<S> {
    stream: S,
    size: u64,
    next_cookie: u64,
    closed: bool,
}

impl NbdClient<UnixStream> {
    pub async fn connect_unix<P: AsRef<Path>>(socket: P, export_name: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket.as_ref()).await.map_err(|e| {
            MigrateError::Nbd(format!(
                "connect {}: {}",
                socket.as_ref().display(),
                e
            ))
        })?;
        Self::handshake(stream, export_name).await
    }
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn handshake(mut stream: S, export_name: &str) -> Result<Self> {
        let magic = stream.read_u64().await?;
        if magic != NBDMAGIC {
            return Err(MigrateError::Nbd(format!("bad server magic {:#x}", magic)));
        }
        let opt_magic = stream.read_u64().await?;
        if opt_magic != IHAVEOPT {
            return Err(MigrateError::Nbd("server does not speak newstyle".to_string()));
        }
        let server_flags = stream.read_u16().await?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(MigrateError::Nbd("server lacks fixed newstyle".to_string()));
        }
        let client_flags = u32::from(FLAG_FIXED_NEWSTYLE | (server_flags & FLAG_NO_ZEROES));
        stream.write_u32(client_flags).await?;

        let name = export_name.as_bytes();
        stream.write_u64(IHAVEOPT).await?;
        stream.write_u32(OPT_GO).await?;
        stream.write_u32(4 + name.len() as u32 + 2).await?;
        stream.write_u32(name.len() as u32).await?;
        stream.write_all(name).await?;
        stream.write_u16(0).await?;
        stream.flush().await?;

        let mut size = None;
        loop {
            let magic = stream.read_u64().await?;
            if magic != OPTION_REPLY_MAGIC {
                return Err(MigrateError::Nbd(format!("bad option reply magic {:#x}", magic)));
            }
            let option = stream.read_u32().await?;
            let reply = stream.read_u32().await?;
            let len = stream.read_u32().await?;
            if option != OPT_GO {
                return Err(MigrateError::Nbd(format!("reply for unexpected option {}", option)));
            }
            if len > MAX_OPTION_REPLY {
                return Err(MigrateError::Nbd(format!("option reply too large ({})", len)));
            }
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data).await?;

            if reply & REP_FLAG_ERROR != 0 {
                return Err(MigrateError::Nbd(format!(
                    "export '{}' refused ({:#x}): {}",
                    export_name,
                    reply,
                    String::from_utf8_lossy(&data)
                )));
            }
            match reply {
                REP_INFO if data.len() >= 12 && u16::from_be_bytes([data[0], data[1]]) == INFO_EXPORT => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data[2..10]);
                    size = Some(u64::from_be_bytes(raw));
                }
                REP_INFO => {}
                REP_ACK => break,
                other => {
                    return Err(MigrateError::Nbd(format!("unexpected option reply {}", other)));
                }
            }
        }

        let size = size.ok_or_else(|| MigrateError::Nbd("server did not report export size".to_string()))?;
        log_debug!("NBD export '{}' open, {} bytes", export_name, size);
        Ok(Self {
            stream,
            size,
            next_cookie: 1,
            closed: false,
        })
    }

    async fn send_request(&mut self, command: u16, offset: u64, length: u32) -> Result<u64> {
        let cookie = self.next_cookie;
        self.next_cookie += 1;

        let mut header = [0u8; 28];
        header[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        header[6..8].copy_from_slice(&command.to_be_bytes());
        header[8..16].copy_from_slice(&cookie.to_be_bytes());
        header[16..24].copy_from_slice(&offset.to_be_bytes());
        header[24..28].copy_from_slice(&length.to_be_bytes());
        self.stream.write_all(&header).await?;
        self.stream.flush().await?;
        Ok(cookie)
    }

    async fn read_request(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let cookie = self.send_request(CMD_READ, offset, buf.len() as u32).await?;

        let magic = self.stream.read_u32().await?;
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(MigrateError::Nbd(format!("bad reply magic {:#x}", magic)));
        }
        let error = self.stream.read_u32().await?;
        let reply_cookie = self.stream.read_u64().await?;
        if reply_cookie != cookie {
            return Err(MigrateError::Nbd(format!(
                "reply cookie {} does not match request {}",
                reply_cookie, cookie
            )));
        }
        if error != 0 {
            return Err(MigrateError::Nbd(format!(
                "read of {} bytes at {} failed with errno {}",
                buf.len(),
                offset,
                error
            )));
        }
        self.stream.read_exact(buf).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> ExportReader for NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.closed {
            return Err(MigrateError::Nbd("read on closed connection".to_string()));
        }
        let in_bounds = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= self.size);
        if !in_bounds {
            return Err(MigrateError::Nbd(format!(
                "read of {} bytes at {} past export end {}",
                buf.len(),
                offset,
                self.size
            )));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let len = (buf.len() - done).min(MAX_REQUEST);
            self.read_request(offset + done as u64, &mut buf[done..done + len])
                .await?;
            done += len;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_request(CMD_DISC, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
