//! SOCKS4/4a/5 front end.
//!
//! Only the TCP CONNECT command is supported; BIND and UDP-ASSOCIATE get a
//! protocol NAK. SOCKS5 clients may offer "no authentication" or
//! username/password; credentials are accepted mechanically, no policy is
//! attached to them.

use std::io::{self, Error, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    Four,
    Five,
}

impl SocksVersion {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            4 => Some(Self::Four),
            5 => Some(Self::Five),
            _ => None,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum SocksRequestError {
    #[error(transparent)]
    Io(#[from] Error),

    #[error("client requested invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("client requested invalid SOCKS4 command: {0}")]
    Socks4InvalidCommand(u8),

    #[error("no acceptable SOCKS5 authentication method")]
    Socks5NoAcceptableAuth,

    #[error("client requested SOCKS5, but then specified another version: {0}")]
    Socks5InvalidVersion(u8),

    #[error("client requested invalid SOCKS5 command: {0}")]
    Socks5InvalidCommand(u8),

    #[error("client requested invalid SOCKS5 address type: {0}")]
    Socks5InvalidAtyp(u8),
}

impl From<SocksRequestError> for Error {
    fn from(value: SocksRequestError) -> Self {
        match value {
            SocksRequestError::Io(error) => error,
            other => Error::new(ErrorKind::Other, other.to_string()),
        }
    }
}

/// Runs the handshake up to (and excluding) the final reply, returning the
/// requested target as `host:port`.
pub async fn read_request<R, W>(
    reader: &mut R,
    writer: &mut W,
) -> Result<(SocksVersion, String), SocksRequestError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let version_byte = reader.read_u8().await?;
    let version = SocksVersion::from_u8(version_byte)
        .ok_or(SocksRequestError::InvalidVersion(version_byte))?;
    let target = match version {
        SocksVersion::Four => read_request_v4(reader).await?,
        SocksVersion::Five => read_request_v5(reader, writer).await?,
    };
    Ok((version, target))
}

async fn read_request_v4<R>(reader: &mut R) -> Result<String, SocksRequestError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let command = reader.read_u8().await?;
    if command != 1 {
        return Err(SocksRequestError::Socks4InvalidCommand(command));
    }
    let port = reader.read_u16().await?;
    let mut octets = [0u8; 4];
    reader.read_exact(&mut octets).await?;

    // USERID, ignored.
    read_until_nul(reader).await?;

    // SOCKS4a: 0.0.0.x with nonzero x means a domain name follows.
    let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
        read_until_nul(reader).await?
    } else {
        Ipv4Addr::from(octets).to_string()
    };
    Ok(format!("{host}:{port}"))
}

async fn read_until_nul<R>(reader: &mut R) -> Result<String, SocksRequestError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8().await?;
        if b == 0 {
            break;
        }
        if bytes.len() >= 256 {
            return Err(Error::new(ErrorKind::InvalidData, "SOCKS4 field too long").into());
        }
        bytes.push(b);
    }
    String::from_utf8(bytes)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "SOCKS4 field is not UTF-8").into())
}

async fn read_request_v5<R, W>(reader: &mut R, writer: &mut W) -> Result<String, SocksRequestError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    // Auth negotiation: prefer no-auth, fall back to username/password.
    let nmethods = reader.read_u8().await?;
    let mut noauth = false;
    let mut userpass = false;
    for _ in 0..nmethods {
        match reader.read_u8().await? {
            0 => noauth = true,
            2 => userpass = true,
            _ => {}
        }
    }
    if noauth {
        writer.write_all(&[5, 0]).await?;
    } else if userpass {
        writer.write_all(&[5, 2]).await?;
        // RFC 1929 subnegotiation; credentials are carried, never checked.
        let _ver = reader.read_u8().await?;
        let ulen = reader.read_u8().await? as usize;
        let mut user = vec![0u8; ulen];
        reader.read_exact(&mut user).await?;
        let plen = reader.read_u8().await? as usize;
        let mut passwd = vec![0u8; plen];
        reader.read_exact(&mut passwd).await?;
        writer.write_all(&[1, 0]).await?;
    } else {
        return Err(SocksRequestError::Socks5NoAcceptableAuth);
    }

    let version = reader.read_u8().await?;
    if version != 5 {
        return Err(SocksRequestError::Socks5InvalidVersion(version));
    }
    let command = reader.read_u8().await?;
    if command != 1 {
        return Err(SocksRequestError::Socks5InvalidCommand(command));
    }
    let _reserved = reader.read_u8().await?;

    let atyp = reader.read_u8().await?;
    let host = match atyp {
        1 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        3 => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| {
                Error::new(ErrorKind::InvalidData, "SOCKS5 domain name is not UTF-8")
            })?
        }
        4 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        other => return Err(SocksRequestError::Socks5InvalidAtyp(other)),
    };
    let port = reader.read_u16().await?;
    Ok(format!("{host}:{port}"))
}

/// Grants the connect request. The bound address is reported as unspecified;
/// clients only use it for BIND, which this proxy refuses anyway.
pub async fn send_success<W>(writer: &mut W, version: SocksVersion) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match version {
        SocksVersion::Four => writer.write_all(&[0, 90, 0, 0, 0, 0, 0, 0]).await,
        SocksVersion::Five => writer.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await,
    }
}

/// Reports that the tunnel could not be opened.
pub async fn send_failure<W>(writer: &mut W, version: SocksVersion) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match version {
        SocksVersion::Four => writer.write_all(&[0, 91, 0, 0, 0, 0, 0, 0]).await,
        SocksVersion::Five => writer.write_all(&[5, 1, 0, 1, 0, 0, 0, 0, 0, 0]).await,
    }
}

/// Sends whatever protocol NAK the handshake error calls for. IO errors get
/// nothing; the connection is already gone.
pub async fn send_request_error<W>(writer: &mut W, error: &SocksRequestError) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match error {
        SocksRequestError::Socks5NoAcceptableAuth => writer.write_all(&[5, 0xFF]).await,
        SocksRequestError::Socks5InvalidCommand(_) => {
            writer.write_all(&[5, 7, 0, 1, 0, 0, 0, 0, 0, 0]).await
        }
        SocksRequestError::Socks5InvalidAtyp(_) => {
            writer.write_all(&[5, 8, 0, 1, 0, 0, 0, 0, 0, 0]).await
        }
        SocksRequestError::Socks4InvalidCommand(_) => {
            writer.write_all(&[0, 91, 0, 0, 0, 0, 0, 0]).await
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socks5_noauth_connect_domain() {
        let request = [
            &[5u8, 1, 0][..],                       // greeting: one method, no-auth
            &[5, 1, 0, 3, 11],                      // connect, domain, len 11
            b"example.com",
            &[0x01, 0xBB],                          // port 443
        ]
        .concat();
        let mut reader = &request[..];
        let mut written = Vec::new();
        let (version, target) = read_request(&mut reader, &mut written).await.unwrap();
        assert_eq!(version, SocksVersion::Five);
        assert_eq!(target, "example.com:443");
        assert_eq!(written, [5, 0]);
    }

    #[tokio::test]
    async fn socks5_userpass_connect_ipv4() {
        let request = [
            &[5u8, 1, 2][..],                       // greeting: only user/pass
            &[1, 2], b"ab", &[1], b"x",             // RFC 1929: user "ab", pass "x"
            &[5, 1, 0, 1, 10, 0, 0, 1, 0x1F, 0x90], // connect 10.0.0.1:8080
        ]
        .concat();
        let mut reader = &request[..];
        let mut written = Vec::new();
        let (_, target) = read_request(&mut reader, &mut written).await.unwrap();
        assert_eq!(target, "10.0.0.1:8080");
        assert_eq!(written, [5, 2, 1, 0]);
    }

    #[tokio::test]
    async fn socks5_bind_is_refused() {
        let request = [
            &[5u8, 1, 0][..],
            &[5, 2, 0, 1, 1, 2, 3, 4, 0, 80], // BIND
        ]
        .concat();
        let mut reader = &request[..];
        let mut written = Vec::new();
        let err = read_request(&mut reader, &mut written).await.unwrap_err();
        assert!(matches!(err, SocksRequestError::Socks5InvalidCommand(2)));
    }

    #[tokio::test]
    async fn socks4_connect_ip() {
        let request = [
            &[4u8, 1, 0x00, 0x50][..], // connect, port 80
            &[93, 184, 216, 34],
            b"user\0",
        ]
        .concat();
        let mut reader = &request[..];
        let mut written = Vec::new();
        let (version, target) = read_request(&mut reader, &mut written).await.unwrap();
        assert_eq!(version, SocksVersion::Four);
        assert_eq!(target, "93.184.216.34:80");
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn socks4a_domain() {
        let request = [
            &[4u8, 1, 0x01, 0xBB][..],
            &[0, 0, 0, 1],
            b"user\0",
            b"example.org\0",
        ]
        .concat();
        let mut reader = &request[..];
        let mut written = Vec::new();
        let (_, target) = read_request(&mut reader, &mut written).await.unwrap();
        assert_eq!(target, "example.org:443");
    }

    #[tokio::test]
    async fn no_acceptable_auth_naks() {
        let err = SocksRequestError::Socks5NoAcceptableAuth;
        let mut written = Vec::new();
        send_request_error(&mut written, &err).await.unwrap();
        assert_eq!(written, [5, 0xFF]);
    }
}
