use anyhow::Result;
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::common::Address;

pub const CMD_CONNECT: u8 = 0x01;

/// SHA-224(password) 的小写 hex，固定 56 字节
pub fn password_hash(password: &str) -> String {
    Sha224::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// 编码请求头：
/// `hex(SHA224(password)) CRLF CMD ATYP ADDR PORT CRLF`
pub fn encode_request(password_hash: &str, target: &Address, command: u8) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(password_hash.len() + 4 + 1 + 1 + 256 + 2);
    buf.put_slice(password_hash.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_u8(command);
    target.encode_socks5(&mut buf)?;
    buf.put_slice(b"\r\n");
    Ok(buf)
}

/// 写入请求头，之后的字节即为隧道载荷
pub async fn write_request(
    stream: &mut (impl AsyncWrite + Unpin),
    password_hash: &str,
    target: &Address,
    command: u8,
) -> Result<()> {
    let buf = encode_request(password_hash, target, command)?;
    stream.write_all(&buf).await?;
    Ok(())
}
