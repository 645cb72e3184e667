// ── Client association ──
//
// One long-lived service per client. Associates on the first open VAP
// with slot-time backoff, learns its address (DHCP when it has no static
// one), then serves until the AP goes away, the controller
// deauthenticates it, or it is asked to leave.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use super::dhcp::{ClientServiceDhcp, DhcpOutcome};
use crate::config::AssociationTimers;
use crate::device::{Ap, Client, WirelessDevice};
use crate::error::Stop;
use crate::events::WirelessEvent;
use crate::model::{ClientState, MacAddress};
use crate::service::{Service, ServiceContext, Wake, names};
use crate::wire::dot11::{self, FrameKind};

/// Longest single backoff wait, in seconds.
const MAX_BACKOFF_SECS: f64 = 3600.0;

/// Wait before association retry `retries`.
pub fn association_backoff(timers: &AssociationTimers, retries: u32, seed: u32) -> Duration {
    slot_backoff(timers.slot_time, retries, seed)
}

/// `slot_time^(retries + 1)` seconds, spread by up to one second either way.
pub fn slot_backoff(slot_time: f64, retries: u32, seed: u32) -> Duration {
    let exponent = i32::try_from(retries.saturating_add(1)).unwrap_or(i32::MAX);
    let base = slot_time.powi(exponent);

    // Deterministic jitter seeded from the retry count and the station.
    let jitter = (f64::from(retries) * 7.3 + f64::from(seed)).sin();
    let secs = (base + jitter).max(0.0).min(MAX_BACKOFF_SECS);

    Duration::from_secs_f64(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOutcome {
    /// Left on request, after a disassociation.
    Left,
    /// The AP was dropped.
    ApGone,
}

/// What ended one step of the state machine.
enum Step {
    Continue,
    Deassociated,
}

#[derive(Debug, Default)]
pub struct ClientServiceAssociation;

impl Service<Client> for ClientServiceAssociation {
    type Output = AssociationOutcome;

    const NAME: &'static str = names::CLIENT_ASSOCIATION;

    async fn run(self, ctx: &mut ServiceContext<Client>) -> Result<AssociationOutcome, Stop> {
        let client = Arc::clone(ctx.device());
        ctx.request_start(true, true).await?;
        let timers = ctx.config().client.clone();

        loop {
            if client.take_leave_request() {
                leave(ctx, &client)?;
                return Ok(AssociationOutcome::Left);
            }
            let Some(ap) = client.ap() else {
                ctx.request_stop(true, false, true);
                return Ok(AssociationOutcome::ApGone);
            };
            if client.got_disconnect() {
                client.clear_disconnect();
                if client.state() != ClientState::Association {
                    debug!(client = %client.mac(), "AP disconnected, re-associating");
                    deassociate(ctx, &client)?;
                }
            }

            let step = match client.state() {
                ClientState::Association => associate(ctx, &client, &ap, &timers).await?,
                ClientState::IpLearn => learn_ip(ctx, &client, &timers).await?,
                ClientState::Run => serve(ctx, &client, &ap).await?,
            };
            if let Step::Deassociated = step {
                deassociate(ctx, &client)?;
            }
        }
    }
}

/// Jitter seed covering the whole station address.
pub fn backoff_seed(mac: MacAddress) -> u32 {
    mac.octets()
        .iter()
        .fold(0u32, |acc, octet| acc.wrapping_mul(31).wrapping_add(u32::from(*octet)))
}

fn seed(client: &Client) -> u32 {
    backoff_seed(client.mac())
}

/// Whether the service should stop waiting and re-check its flags.
fn interrupted(client: &Client) -> bool {
    client.got_disconnect() || client.ap().is_none()
}

async fn associate(
    ctx: &mut ServiceContext<Client>,
    client: &Arc<Client>,
    ap: &Ap,
    timers: &AssociationTimers,
) -> Result<Step, Stop> {
    let retries = client.count_retry();
    if retries >= timers.max_retries {
        info!(client = %client.mac(), retries, "association retries exhausted, starting over");
        client.reset_retries();
    }
    let wait = association_backoff(timers, retries.min(timers.max_retries), seed(client));
    let deadline = Instant::now() + wait;

    let vap = if ap.state().is_joined() { ap.open_vap() } else { None };
    let Some(vap) = vap else {
        // Nothing to associate with yet: wait for the AP to join or learn an SSID.
        let events = [
            WirelessEvent::ap_joined(ap.mac()),
            WirelessEvent::ap_vap_received(ap.mac()),
        ];
        ctx.wait_for_any_events(&events, false, Some(wait)).await?;
        return Ok(Step::Continue);
    };
    let Some(request) = client.association_frame(&vap) else {
        return Ok(Step::Continue);
    };
    debug!(client = %client.mac(), ssid = %vap.ssid, retries, "association request");
    ctx.send(request);

    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match ctx.wait_for_any_events(&[], true, Some(remaining)).await? {
            Wake::Packets(frames) => {
                for frame in &frames {
                    match classify(client, frame) {
                        Received::Associated => {
                            client.reset_retries();
                            client.set_state(ClientState::IpLearn);
                            return Ok(Step::Continue);
                        }
                        Received::Dropped => return Ok(Step::Deassociated),
                        Received::Other => {}
                    }
                }
            }
            Wake::Woken if interrupted(client) => return Ok(Step::Continue),
            Wake::Woken | Wake::Event(_) => {}
            Wake::TimedOut => break,
        }
    }
    Ok(Step::Continue)
}

async fn learn_ip(
    ctx: &mut ServiceContext<Client>,
    client: &Arc<Client>,
    timers: &AssociationTimers,
) -> Result<Step, Stop> {
    if client.static_ip().is_none() {
        return learn_lease(ctx, client).await;
    }
    let (Some(garp), Some(gateway_arp)) = (client.gratuitous_arp(), client.gateway_arp_request()) else {
        // Static address without a gateway: nothing to resolve.
        associated(ctx, client)?;
        return Ok(Step::Continue);
    };
    client.reset_arp_reply();
    ctx.send(garp);
    ctx.send(gateway_arp);

    let retries = client.count_retry();
    let wait = association_backoff(timers, retries, seed(client));
    let resolved = ctx
        .wait_until(Instant::now() + wait, || {
            if client.seen_arp_reply() {
                return Some(true);
            }
            interrupted(client).then_some(false)
        })
        .await?;
    match resolved {
        Some(true) => {
            client.reset_retries();
            associated(ctx, client)?;
        }
        Some(false) => {}
        None if retries + 1 >= timers.max_retries => {
            info!(client = %client.mac(), "gateway never answered, re-associating");
            return Ok(Step::Deassociated);
        }
        None => {}
    }
    Ok(Step::Continue)
}

async fn learn_lease(ctx: &mut ServiceContext<Client>, client: &Arc<Client>) -> Result<Step, Stop> {
    match ctx.launch(ClientServiceDhcp).await? {
        DhcpOutcome::Bound(_) | DhcpOutcome::StaticAddress => associated(ctx, client)?,
        DhcpOutcome::TimedOut => {
            info!(client = %client.mac(), "no DHCP lease, trying again");
        }
        DhcpOutcome::NotReady => {}
    }
    Ok(Step::Continue)
}

async fn serve(ctx: &mut ServiceContext<Client>, client: &Arc<Client>, ap: &Ap) -> Result<Step, Stop> {
    let events = [WirelessEvent::ap_disconnected(ap.mac())];
    match ctx.wait_for_any_events(&events, true, None).await? {
        Wake::Packets(frames) => {
            if frames.iter().any(|frame| matches!(classify(client, frame), Received::Dropped)) {
                return Ok(Step::Deassociated);
            }
        }
        Wake::Event(_) => client.mark_disconnected(),
        Wake::Woken | Wake::TimedOut => {}
    }
    Ok(Step::Continue)
}

fn associated(ctx: &ServiceContext<Client>, client: &Client) -> Result<(), Stop> {
    client.set_state(ClientState::Run);
    info!(client = %client.mac(), ap = %client.ap_mac(), "client associated");
    ctx.raise_event(&WirelessEvent::client_associated(client.mac()))
}

fn deassociate(ctx: &ServiceContext<Client>, client: &Client) -> Result<(), Stop> {
    client.set_state(ClientState::Association);
    client.reset_retries();
    client.release_lease();
    ctx.raise_event(&WirelessEvent::client_deassociated(client.mac()))
}

fn leave(ctx: &mut ServiceContext<Client>, client: &Client) -> Result<(), Stop> {
    if client.state() != ClientState::Association {
        if let Some(frame) = client.disassociation_frame() {
            ctx.send(frame);
        }
        deassociate(ctx, client)?;
    }
    ctx.request_stop(true, true, true);
    Ok(())
}

enum Received {
    Associated,
    Dropped,
    Other,
}

fn classify(client: &Client, frame: &Bytes) -> Received {
    if dot11::addr1(frame) != Some(client.mac()) {
        return Received::Other;
    }
    match dot11::classify(frame) {
        FrameKind::AssocResponse if dot11::association_status(frame) == Some(0) => Received::Associated,
        FrameKind::AssocResponse => {
            debug!(client = %client.mac(), status = ?dot11::association_status(frame), "association refused");
            Received::Other
        }
        FrameKind::Deauth | FrameKind::Disassoc => Received::Dropped,
        _ => Received::Other,
    }
}
