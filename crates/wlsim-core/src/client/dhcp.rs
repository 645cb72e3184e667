// ── Client DHCP ──
//
// DISCOVER, OFFER, REQUEST, ACK for a client without a static address,
// run from IP_LEARN. Every wait follows the slot-time backoff; after
// `max_retries` unanswered rounds in a row the exchange is abandoned
// and reported as timed out. A NAK restarts it from DISCOVER.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::association::{backoff_seed, slot_backoff};
use crate::config::DhcpTimers;
use crate::device::{Client, WirelessDevice};
use crate::error::Stop;
use crate::events::WirelessEvent;
use crate::model::{ClientState, DhcpLease};
use crate::service::{Service, ServiceContext, Wake, names};
use crate::wire::dhcp::{self, DhcpMessage, MessageType};
use crate::wire::dot11;
use crate::wire::ether::{ETHERTYPE_IPV4, parse_ipv4_udp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOutcome {
    Bound(DhcpLease),
    /// The client has a static address; nothing was sent.
    StaticAddress,
    /// `max_retries` rounds went unanswered.
    TimedOut,
    /// The client left IP_LEARN, lost its AP or was asked to leave
    /// mid-exchange.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum DhcpState {
    Init,
    Selecting,
    Requesting,
    Bound,
}

/// One transaction's progress.
#[derive(Debug)]
struct Exchange {
    xid: u32,
    seed: u32,
    state: DhcpState,
    offer: Option<DhcpMessage>,
    ack: Option<DhcpMessage>,
    retries: u32,
    total_retries: u32,
}

impl Exchange {
    fn new(xid: u32, seed: u32) -> Self {
        Self {
            xid,
            seed,
            state: DhcpState::Init,
            offer: None,
            ack: None,
            retries: 0,
            total_retries: 0,
        }
    }

    fn wait(&self, timers: &DhcpTimers) -> Duration {
        slot_backoff(timers.slot_time, self.retries, self.seed)
    }

    fn reset(&mut self) {
        self.state = DhcpState::Init;
        self.offer = None;
        self.ack = None;
        self.retries = 0;
    }

    /// Count an unanswered round. True once `max_retries` rounds in a
    /// row went unanswered; the exchange is then back at INIT.
    fn count_timeout(&mut self, max_retries: u32) -> bool {
        self.total_retries += 1;
        self.retries += 1;
        if self.retries >= max_retries {
            self.reset();
            return true;
        }
        false
    }

    /// Offer merged with the ACK; the ACK wins where both carry a value.
    fn lease(&self) -> Option<DhcpLease> {
        let offer = self.offer.as_ref()?;
        let ack = self.ack.as_ref()?;
        let ip = if ack.yiaddr.is_unspecified() { offer.yiaddr } else { ack.yiaddr };
        let (a, o) = (&ack.options, &offer.options);
        Some(DhcpLease {
            ip,
            server_ip: a.server_id.or(o.server_id),
            subnet_mask: a.subnet_mask.or(o.subnet_mask),
            router: a.router.or(o.router),
            lease_time: a.lease_time.or(o.lease_time),
            domain: a.domain.clone().or_else(|| o.domain.clone()),
        })
    }
}

fn transaction_id() -> u32 {
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// DHCP may only run while the client sits in IP_LEARN under a live AP
/// and has not been asked to leave.
fn ready(client: &Client) -> bool {
    client.state() == ClientState::IpLearn
        && !client.got_disconnect()
        && !client.leave_requested()
        && client.ap().is_some()
}

#[derive(Debug, Default)]
pub struct ClientServiceDhcp;

impl Service<Client> for ClientServiceDhcp {
    type Output = DhcpOutcome;

    const NAME: &'static str = names::CLIENT_DHCP;

    async fn run(self, ctx: &mut ServiceContext<Client>) -> Result<DhcpOutcome, Stop> {
        let client = Arc::clone(ctx.device());
        if client.static_ip().is_some() {
            debug!(client = %client.mac(), "static address, DHCP not run");
            return Ok(DhcpOutcome::StaticAddress);
        }
        ctx.request_start(true, true).await?;
        let timers = ctx.config().dhcp.clone();
        let mut exchange = Exchange::new(transaction_id(), backoff_seed(client.mac()));
        debug!(client = %client.mac(), xid = exchange.xid, "DHCP started");

        loop {
            if !ready(&client) {
                debug!(client = %client.mac(), state = %client.state(), "client not ready, DHCP stopped");
                return Ok(finish(ctx, &exchange, DhcpOutcome::NotReady));
            }
            match exchange.state {
                DhcpState::Init => {
                    send(ctx, &client, &dhcp::discover(exchange.xid, client.mac()));
                    exchange.state = DhcpState::Selecting;
                }
                DhcpState::Selecting => {
                    if exchange.offer.is_none() {
                        let wait = exchange.wait(&timers);
                        match await_reply(ctx, &client, exchange.xid, &[MessageType::Offer], wait).await? {
                            Reply::Answer(offer) => {
                                debug!(client = %client.mac(), offered = %offer.yiaddr, "DHCPOFFER");
                                exchange.offer = Some(offer);
                            }
                            Reply::NotReady => continue,
                            Reply::TimedOut => {
                                debug!(client = %client.mac(), retries = exchange.retries, "no DHCPOFFER");
                                exchange.state = DhcpState::Init;
                                if exchange.count_timeout(timers.max_retries) {
                                    return Ok(timed_out(ctx, &client, &exchange));
                                }
                                continue;
                            }
                        }
                    }
                    let Some(offer) = exchange.offer.as_ref() else {
                        continue;
                    };
                    let server = offer.options.server_id.unwrap_or(Ipv4Addr::BROADCAST);
                    send(ctx, &client, &dhcp::request(exchange.xid, client.mac(), offer.yiaddr, server));
                    exchange.state = DhcpState::Requesting;
                }
                DhcpState::Requesting => {
                    let wait = exchange.wait(&timers);
                    let wanted = [MessageType::Ack, MessageType::Nak];
                    match await_reply(ctx, &client, exchange.xid, &wanted, wait).await? {
                        Reply::Answer(ack) if ack.message_type() == Some(MessageType::Ack) => {
                            exchange.ack = Some(ack);
                            exchange.state = DhcpState::Bound;
                        }
                        Reply::Answer(_) => {
                            info!(client = %client.mac(), "DHCPNAK, starting over");
                            exchange.reset();
                            ctx.sleep(timers.nak_wait).await?;
                        }
                        Reply::NotReady => {}
                        Reply::TimedOut => {
                            debug!(client = %client.mac(), retries = exchange.retries, "no DHCPACK");
                            // Resend the REQUEST for the same offer.
                            exchange.state = DhcpState::Selecting;
                            if exchange.count_timeout(timers.max_retries) {
                                return Ok(timed_out(ctx, &client, &exchange));
                            }
                        }
                    }
                }
                DhcpState::Bound => {
                    let Some(lease) = exchange.lease() else {
                        exchange.reset();
                        continue;
                    };
                    client.bind_lease(lease.clone());
                    ctx.raise_event(&WirelessEvent::client_dhcp_done(client.mac()))?;
                    info!(
                        client = %client.mac(),
                        ip = %lease.ip,
                        gateway = ?lease.router,
                        "DHCP bound"
                    );
                    return Ok(finish(ctx, &exchange, DhcpOutcome::Bound(lease)));
                }
            }
        }
    }
}

fn send(ctx: &ServiceContext<Client>, client: &Client, message: &DhcpMessage) {
    debug!(client = %client.mac(), kind = ?message.message_type(), xid = message.xid, "DHCP send");
    if let Some(frame) = client.ethernet_frame(&dhcp::client_frame(client.mac(), message)) {
        ctx.send(frame);
    }
}

fn timed_out(ctx: &mut ServiceContext<Client>, client: &Client, exchange: &Exchange) -> DhcpOutcome {
    info!(client = %client.mac(), total_retries = exchange.total_retries, "DHCP timed out");
    finish(ctx, exchange, DhcpOutcome::TimedOut)
}

fn finish(ctx: &mut ServiceContext<Client>, exchange: &Exchange, outcome: DhcpOutcome) -> DhcpOutcome {
    ctx.add_service_info("total_retries", exchange.total_retries);
    let success = matches!(outcome, DhcpOutcome::Bound(_));
    ctx.request_stop(true, success, true);
    outcome
}

enum Reply {
    Answer(DhcpMessage),
    TimedOut,
    NotReady,
}

/// First server reply of transaction `xid` with one of the `wanted`
/// types, within `wait`. Other traffic is ignored.
async fn await_reply(
    ctx: &mut ServiceContext<Client>,
    client: &Client,
    xid: u32,
    wanted: &[MessageType],
    wait: Duration,
) -> Result<Reply, Stop> {
    let deadline = Instant::now() + wait;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match ctx.wait_for_any_events(&[], true, Some(remaining)).await? {
            Wake::Packets(frames) => {
                let answer = frames
                    .iter()
                    .filter_map(|frame| server_reply(client, frame))
                    .find(|reply| {
                        reply.xid == xid && reply.message_type().is_some_and(|ty| wanted.contains(&ty))
                    });
                if let Some(answer) = answer {
                    return Ok(Reply::Answer(answer));
                }
            }
            Wake::Woken if !ready(client) => return Ok(Reply::NotReady),
            Wake::Woken | Wake::Event(_) => {}
            Wake::TimedOut => break,
        }
    }
    Ok(Reply::TimedOut)
}

/// A DHCP reply for `client` inside a received 802.11 data frame.
fn server_reply(client: &Client, frame: &[u8]) -> Option<DhcpMessage> {
    let (ethertype, packet) = dot11::data_payload(frame)?;
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let udp = parse_ipv4_udp(packet)?;
    if udp.dst_port != dhcp::CLIENT_PORT {
        return None;
    }
    let message = DhcpMessage::parse(udp.payload).ok()?;
    (message.is_reply() && message.chaddr == client.mac()).then_some(message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn timers() -> DhcpTimers {
        DhcpTimers {
            slot_time: 2.0,
            max_retries: 3,
            nak_wait: Duration::from_secs(1),
        }
    }

    fn offer() -> DhcpMessage {
        let client = crate::model::MacAddress::new([2, 0, 0, 0, 0, 1]);
        let options = dhcp::DhcpOptions {
            message_type: Some(MessageType::Offer),
            server_id: Some(Ipv4Addr::new(10, 0, 0, 1)),
            router: Some(Ipv4Addr::new(10, 0, 0, 254)),
            domain: Some("offer.local".into()),
            ..dhcp::DhcpOptions::default()
        };
        dhcp::reply(&dhcp::discover(5, client), Ipv4Addr::new(10, 0, 0, 50), options)
    }

    #[test]
    fn exchange_rolls_back_after_max_retries() {
        let mut exchange = Exchange::new(5, 0);
        exchange.state = DhcpState::Requesting;
        exchange.offer = Some(offer());

        assert!(!exchange.count_timeout(3));
        assert!(!exchange.count_timeout(3));
        assert!(exchange.count_timeout(3));

        assert_eq!(exchange.state, DhcpState::Init);
        assert!(exchange.offer.is_none());
        assert_eq!(exchange.retries, 0);
        assert_eq!(exchange.total_retries, 3);
    }

    #[test]
    fn waits_grow_with_each_unanswered_round() {
        let mut exchange = Exchange::new(5, 17);
        let first = exchange.wait(&timers());
        exchange.count_timeout(3);
        let second = exchange.wait(&timers());
        assert!(first <= Duration::from_secs(3));
        assert!(second >= Duration::from_secs(3));
    }

    #[test]
    fn lease_prefers_ack_values() {
        let mut exchange = Exchange::new(5, 0);
        exchange.offer = Some(offer());
        assert!(exchange.lease().is_none(), "no lease before the ACK");

        let mut ack = offer();
        ack.options.message_type = Some(MessageType::Ack);
        ack.options.domain = Some("ack.local".into());
        ack.options.router = None;
        exchange.ack = Some(ack);

        let lease = exchange.lease().unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(lease.domain.as_deref(), Some("ack.local"));
        assert_eq!(lease.router, Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(lease.server_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }
}
