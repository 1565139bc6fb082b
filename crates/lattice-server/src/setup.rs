//! Translate `config.ron` sections into lattice-net settings.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hex::FromHex;
use lattice_config::{PipelineSection, TcpSection, UdpSection};
use lattice_net::{
    AesGcmEncryption, ArqConfig, Delivery, EncryptionError, FrameConfig, Lz4Compression,
    MessagePipeline, PostcardProtocol, SocketConfig, TcpServerConfig, TranscoderFactory,
    UdpServerConfig, framed_factory,
};

use crate::messages::DemoMessage;

/// Errors turning the configuration into running endpoints.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// A bind address did not parse.
    #[error("invalid bind address {0:?}")]
    BindAddress(String),
    /// The encryption key is not valid hex.
    #[error("encryption key is not hex: {0}")]
    KeyEncoding(#[from] hex::FromHexError),
    /// The encryption key has the wrong length.
    #[error(transparent)]
    Key(#[from] EncryptionError),
}

fn bind_addr(address: &str, port: u16) -> Result<SocketAddr, SetupError> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| SetupError::BindAddress(address.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Build the transcoder factory both servers share.
pub fn transcoder_factory(
    section: &PipelineSection,
) -> Result<TranscoderFactory<DemoMessage>, SetupError> {
    let mut pipeline = MessagePipeline::new(PostcardProtocol::new());
    if section.compression {
        pipeline = pipeline.with_compression(Lz4Compression {
            threshold: section.compression_threshold,
            enabled: true,
            max_decompressed_size: section.max_frame_size as usize,
        });
    }
    if let Some(key) = &section.encryption_key {
        let key = Vec::<u8>::from_hex(key.trim())?;
        pipeline = pipeline.with_encryption(AesGcmEncryption::new(&key)?);
    }

    let frame_config = FrameConfig {
        max_payload_size: section.max_frame_size,
    };
    Ok(framed_factory(pipeline, frame_config))
}

/// TCP server settings. Messages are queued for the game tick.
pub fn tcp_config(section: &TcpSection) -> Result<TcpServerConfig, SetupError> {
    let defaults = SocketConfig::default();
    let socket = match section.keepalive_secs {
        Some(secs) => SocketConfig {
            tcp_nodelay: section.nodelay,
            keepalive_idle: Duration::from_secs(secs),
            ..defaults
        },
        None => SocketConfig {
            tcp_nodelay: section.nodelay,
            keepalive_enabled: false,
            ..defaults
        },
    };

    Ok(TcpServerConfig {
        bind_addr: bind_addr(&section.bind_address, section.port)?,
        max_sessions: section.max_sessions,
        delivery: Delivery::Queued,
        recv_buffer_size: section.recv_buffer_size,
        socket,
    })
}

/// Reliable-UDP server settings. Messages are queued for the game tick.
pub fn udp_config(section: &UdpSection) -> Result<UdpServerConfig, SetupError> {
    Ok(UdpServerConfig {
        bind_addr: bind_addr(&section.bind_address, section.port)?,
        arq: ArqConfig {
            nodelay: section.nodelay,
            interval_ms: section.interval_ms,
            fast_resend: section.fast_resend,
            congestion_control: section.congestion_control,
            send_window: section.send_window,
            recv_window: section.recv_window,
            mtu: section.mtu,
        },
        tick_interval: Duration::from_millis(section.tick_ms.max(1)),
        delivery: Delivery::Queued,
        recv_buffer_size: section.recv_buffer_size,
        handshake_ttl: Duration::from_secs(section.handshake_ttl_secs),
        socket: SocketConfig::default(),
    })
}
