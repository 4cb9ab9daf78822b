//! rust-mqtt connection task
//!
//! The client borrows its socket and buffers, so it lives inside a dedicated task.
//! The node loop talks to it one request at a time through
//! [`crate::session::ChannelMqttLink`].

use crate::config;
use crate::identity::Topic;
use crate::session::{
    ConnectRequest, InboundMessage, LinkError, MqttChannels, QoS, Request, Response,
    receive_queued,
};
use crate::NodeError;
use core::cell::RefCell;
use core::net::Ipv4Addr;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Stack};
use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::{ErrorType, Read, Write};
use heapless::Vec;
use log::{debug, error, info, warn};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

const SOCKET_BUFFER: usize = 2048;
const CLIENT_BUFFER: usize = 1024;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport adapter wrapping an embassy-net TCP socket for rust-mqtt.
///
/// The socket is shared with the connection loop so it can look at the receive
/// queue between requests. Both run in the same task and never overlap.
pub struct EmbassyNetTransport<'a, 'b> {
    socket: &'a RefCell<TcpSocket<'b>>,
}

impl ErrorType for EmbassyNetTransport<'_, '_> {
    type Error = embassy_net::tcp::Error;
}

#[allow(clippy::await_holding_refcell_ref)]
impl Read for EmbassyNetTransport<'_, '_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.socket.borrow_mut().read(buf).await
    }
}

#[allow(clippy::await_holding_refcell_ref)]
impl Write for EmbassyNetTransport<'_, '_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.socket.borrow_mut().write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.socket.borrow_mut().flush().await
    }
}

fn to_qos(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::QoS0,
        QoS::AtLeastOnce => QualityOfService::QoS1,
    }
}

async fn resolve_broker(stack: Stack<'static>) -> Result<IpAddress, NodeError> {
    if let Ok(ip) = config::MQTT_BROKER_HOST.parse::<Ipv4Addr>() {
        return Ok(IpAddress::Ipv4(ip));
    }
    let addresses = stack
        .dns_query(config::MQTT_BROKER_HOST, DnsQueryType::A)
        .await
        .map_err(|e| {
            warn!("[MQTT] DNS lookup of {} failed: {:?}", config::MQTT_BROKER_HOST, e);
            NodeError::MqttError
        })?;
    addresses.first().copied().ok_or(NodeError::MqttError)
}

/// Owns the broker connection; serves requests from the node's link
#[embassy_executor::task]
pub async fn mqtt_task(stack: Stack<'static>, channels: &'static MqttChannels) -> ! {
    let mut rx_buffer = [0u8; SOCKET_BUFFER];
    let mut tx_buffer = [0u8; SOCKET_BUFFER];
    let mut recv_buffer = [0u8; CLIENT_BUFFER];
    let mut write_buffer = [0u8; CLIENT_BUFFER];
    let mut pending: Option<ConnectRequest> = None;

    info!("[MQTT] Connection task started");
    loop {
        let options = match pending.take() {
            Some(options) => options,
            None => match channels.requests.receive().await {
                Request::Connect(options) => options,
                _ => {
                    channels.responses.send(Err(LinkError::NotConnected)).await;
                    continue;
                }
            },
        };

        pending = run_connection(
            stack,
            channels,
            &options,
            &mut rx_buffer,
            &mut tx_buffer,
            &mut recv_buffer,
            &mut write_buffer,
        )
        .await;
        channels.set_connected(false);
    }
}

/// Connect, then serve requests until the connection ends.
///
/// Returns the options of a connect request that arrived while connected; the
/// caller answers it with a fresh connection.
async fn run_connection(
    stack: Stack<'static>,
    channels: &'static MqttChannels,
    options: &ConnectRequest,
    rx_buffer: &mut [u8],
    tx_buffer: &mut [u8],
    recv_buffer: &mut [u8],
    write_buffer: &mut [u8],
) -> Option<ConnectRequest> {
    let address = match resolve_broker(stack).await {
        Ok(address) => address,
        Err(_) => {
            channels.responses.send(Err(LinkError::Transport)).await;
            return None;
        }
    };

    let socket = RefCell::new(TcpSocket::new(stack, rx_buffer, tx_buffer));
    socket.borrow_mut().set_timeout(Some(SOCKET_TIMEOUT));
    let connected = socket
        .borrow_mut()
        .connect((address, config::MQTT_BROKER_PORT))
        .await;
    if let Err(e) = connected {
        warn!("[MQTT] TCP connect to {}:{} failed: {:?}", address, config::MQTT_BROKER_PORT, e);
        channels.responses.send(Err(LinkError::Transport)).await;
        return None;
    }

    let mut client_config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(0));
    client_config.add_client_id(&options.client_id);
    client_config.keep_alive = options.keep_alive_secs;
    client_config.add_max_subscribe_qos(QualityOfService::QoS1);
    if !options.username.is_empty() {
        client_config.add_username(&options.username);
        if !options.password.is_empty() {
            client_config.add_password(&options.password);
        }
    }
    client_config.add_will(&options.will_topic, &options.will_payload, false);

    let recv_len = recv_buffer.len();
    let write_len = write_buffer.len();
    let mut client = MqttClient::<_, 5, _>::new(
        EmbassyNetTransport { socket: &socket },
        write_buffer,
        write_len,
        recv_buffer,
        recv_len,
        client_config,
    );

    if let Err(reason) = client.connect_to_broker().await {
        warn!("[MQTT] Broker refused connection: {:?}", reason);
        channels.responses.send(Err(LinkError::Refused)).await;
        return None;
    }
    channels.set_connected(true);
    channels.responses.send(Ok(None)).await;

    let keep_alive = Duration::from_secs(u64::from(options.keep_alive_secs.max(2)) / 2);
    let mut last_ping = Instant::now();

    loop {
        let request = channels.requests.receive().await;
        let (response, keep_going) = match request {
            Request::Connect(next) => {
                warn!("[MQTT] Connect requested while connected, reconnecting");
                if let Err(e) = client.disconnect().await {
                    debug!("[MQTT] Disconnect: {:?}", e);
                }
                channels.set_connected(false);
                return Some(next);
            }
            Request::Disconnect => {
                if let Err(e) = client.disconnect().await {
                    debug!("[MQTT] Disconnect: {:?}", e);
                }
                (Ok(None), false)
            }
            Request::Subscribe(topic, qos) => {
                debug!("[MQTT] Subscribing to {} ({:?})", topic, qos);
                match client.subscribe_to_topic(&topic).await {
                    Ok(()) => (Ok(None), true),
                    Err(e) => {
                        warn!("[MQTT] Subscribe to {} failed: {:?}", topic, e);
                        (Err(LinkError::Refused), true)
                    }
                }
            }
            Request::Publish {
                topic,
                payload,
                qos,
                retain,
            } => match client
                .send_message(&topic, &payload, to_qos(qos), retain)
                .await
            {
                Ok(()) | Err(ReasonCode::NoMatchingSubscribers) => (Ok(None), true),
                Err(e) => {
                    error!("[MQTT] Publish to {} failed: {:?}", topic, e);
                    (Err(LinkError::Transport), false)
                }
            },
            Request::Poll => {
                if last_ping.elapsed() >= keep_alive {
                    last_ping = Instant::now();
                    if let Err(e) = client.send_ping().await {
                        warn!("[MQTT] Keepalive failed: {:?}", e);
                        channels.set_connected(false);
                        channels.responses.send(Err(LinkError::Transport)).await;
                        return None;
                    }
                }
                let queued = socket.borrow().recv_queue();
                let received = receive_queued(
                    queued,
                    client.receive_message(),
                    Timer::after(SOCKET_TIMEOUT),
                )
                .await;
                match received {
                    Ok(None) => (Ok(None), true),
                    Ok(Some((topic, payload))) => (inbound(topic, payload), true),
                    Err(e) => (Err(e), false),
                }
            }
        };

        if !keep_going {
            channels.set_connected(false);
        }
        channels.responses.send(response).await;
        if !keep_going {
            info!("[MQTT] Connection closed");
            return None;
        }
    }
}

fn inbound(topic: &str, payload: &[u8]) -> Response {
    let Ok(topic) = Topic::try_from(topic) else {
        warn!("[MQTT] Dropping message on oversized topic");
        return Ok(None);
    };
    let Ok(payload) = Vec::from_slice(payload) else {
        warn!("[MQTT] Dropping {} byte message on {}", payload.len(), topic);
        return Ok(None);
    };
    Ok(Some(InboundMessage { topic, payload }))
}
