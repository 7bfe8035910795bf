//! Connection helpers for the control and data channels.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

pub const DEFAULT_PORT: u16 = 2021;

/// One `host[:port]` endpoint, for a data listener or a dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NetworkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NetworkTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty network target".to_string());
        }

        match s.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("invalid port in target '{s}'"))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: s.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

pub async fn connect_target(target: &NetworkTarget) -> Result<TcpStream> {
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    stream.set_nodelay(true)?;

    tracing::debug!(%target, "connected");

    Ok(stream)
}

/// Dial with an explicit deadline; used for the control channel.
pub async fn connect_target_timeout(
    target: &NetworkTarget,
    timeout: Duration,
) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, connect_target(target)).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {target} timed out"),
        )
        .into()),
    }
}

pub async fn connect_targets(targets: &[NetworkTarget]) -> Result<Vec<TcpStream>> {
    let mut streams = Vec::with_capacity(targets.len());

    for target in targets {
        streams.push(connect_target(target).await?);
    }

    Ok(streams)
}

pub async fn bind_targets(targets: &[NetworkTarget]) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(targets.len());

    for target in targets {
        let listener = TcpListener::bind((target.host.as_str(), target.port)).await?;
        tracing::debug!(addr = %listener.local_addr()?, "bound data listener");
        listeners.push(listener);
    }

    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_with_port() {
        let t: NetworkTarget = "127.0.0.1:6001".parse().unwrap();
        assert_eq!(t.host, "127.0.0.1");
        assert_eq!(t.port, 6001);
    }

    #[test]
    fn test_parse_target_default_port() {
        let t: NetworkTarget = "10.0.0.1".parse().unwrap();
        assert_eq!(t.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_target_rejects_garbage() {
        assert!("".parse::<NetworkTarget>().is_err());
        assert!("host:70000".parse::<NetworkTarget>().is_err());
        assert!("host:12x".parse::<NetworkTarget>().is_err());
    }

    #[tokio::test]
    async fn test_bind_and_connect_loopback() {
        let targets = vec![NetworkTarget {
            host: "127.0.0.1".to_string(),
            port: 0,
        }];

        let listeners = bind_targets(&targets).await.unwrap();
        let addr = listeners[0].local_addr().unwrap();

        let dial = NetworkTarget {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };

        let (client, server) = tokio::join!(
            connect_target_timeout(&dial, Duration::from_secs(1)),
            listeners[0].accept()
        );

        assert!(client.is_ok());
        assert!(server.is_ok());
    }
}
