//! The TDMA worker task: the sole transmitter of an attached device.
//!
//! A master paces the cycle from its own clock, opens it with a sync
//! frame and then fires each slot at its offset. A slave anchors the
//! cycle on sync reception and fires the same slot walk. A backup
//! master behaves as a slave until the primary falls silent past the
//! configured takeover deadline.

use std::sync::Arc;

use super::slot::Slot;
use super::{Role, Tdma, TdmaFlags, TDMA_MAX_SLOT_ID};
use crate::device::DeviceRef;
use crate::sys::{sleep_until, WaitOutcome};
use crate::time::{Duration, Instant};
use crate::wire::{
    EthernetAddress, EthernetFrame, TdmaPacket, TdmaRepr, RTMAC_HEADER_LEN,
};

pub(super) fn run(tdma: Arc<Tdma>) {
    // Sleep until a role is configured.
    let role = loop {
        if tdma.flags().contains(TdmaFlags::SHUTDOWN) {
            return;
        }
        if let Some(role) = tdma.state.lock().role {
            break role;
        }
        match tdma.worker_wakeup.wait(Some(Duration::from_millis(100))) {
            WaitOutcome::Closed => return,
            _ => {}
        }
    };

    let Some(dev) = tdma.device() else {
        return;
    };

    match role {
        Role::Master if !tdma.flags().contains(TdmaFlags::BACKUP_MASTER) => {
            master_loop(&tdma, &dev)
        }
        _ => slave_loop(&tdma, &dev),
    }
}

fn snapshot_slots(tdma: &Tdma) -> heapless::Vec<Arc<Slot>, { TDMA_MAX_SLOT_ID + 1 }> {
    let state = tdma.state.lock();
    let mut slots = heapless::Vec::new();
    for slot in state.slots.iter() {
        if slots.push(slot.clone()).is_err() {
            break;
        }
    }
    slots
}

/// Fire every due slot of one cycle: wait for the slot offset, then
/// transmit at most one frame from its queue.
fn walk_slots(tdma: &Tdma, dev: &DeviceRef, cycle_start: Instant, cycle_no: u64) {
    let slots = snapshot_slots(tdma);
    for slot in slots.iter() {
        if !slot.fires_in(cycle_no) {
            continue;
        }
        sleep_until(cycle_start + slot.offset);
        if tdma.flags().contains(TdmaFlags::SHUTDOWN) {
            return;
        }
        if let Some(skb) = slot.queue.dequeue() {
            let _ = dev.hard_xmit(skb);
        }
    }
}

fn send_sync(tdma: &Tdma, dev: &DeviceRef, cycle_start: Instant) {
    let repr = TdmaRepr::Sync {
        cycle_start_ns: cycle_start.total_nanos() as u64,
    };
    match tdma.build_ctrl_frame(dev, EthernetAddress::BROADCAST, repr) {
        Ok(skb) => {
            let _ = dev.hard_xmit(skb);
        }
        Err(err) => net_debug!("tdma: sync frame skipped: {}", err),
    }
}

/// Transmit one prepared calibration reply, stamping its transmit time.
fn send_cal_reply(tdma: &Tdma, dev: &DeviceRef) {
    let Some(mut reply) = tdma.cal_replies.dequeue() else {
        return;
    };
    let at = EthernetFrame::<&[u8]>::header_len() + RTMAC_HEADER_LEN;
    let now = Instant::now();
    TdmaPacket::new_unchecked(&mut reply.payload_mut()[at..])
        .set_cal_reply_tx_stamp(now.total_nanos() as u64);
    let _ = dev.hard_xmit(reply);
}

fn send_cal_request(tdma: &Tdma, dev: &DeviceRef) {
    let master = tdma
        .sync_state
        .lock()
        .master_addr
        .unwrap_or(EthernetAddress::BROADCAST);
    let now = Instant::now();
    let repr = TdmaRepr::CalRequest {
        tx_stamp_ns: now.total_nanos() as u64,
    };
    match tdma.build_ctrl_frame(dev, master, repr) {
        Ok(skb) => {
            tdma.note_cal_request_tx(now);
            let _ = dev.hard_xmit(skb);
        }
        Err(err) => net_debug!("tdma: calibration request skipped: {}", err),
    }
}

fn master_loop(tdma: &Tdma, dev: &DeviceRef) {
    let mut cycle_start = tdma
        .sync_state
        .lock()
        .cycle_start
        .unwrap_or_else(Instant::now);
    // The master is in sync with itself from the first cycle on.
    tdma.set_flag(TdmaFlags::CALIBRATED, true);

    loop {
        if tdma.flags().contains(TdmaFlags::SHUTDOWN) {
            return;
        }
        let period = tdma.state.lock().cycle_period;

        sleep_until(cycle_start);
        send_sync(tdma, dev, cycle_start);

        let cycle_no = {
            let mut sync = tdma.sync_state.lock();
            sync.cycle_no = sync.cycle_no.wrapping_add(1);
            sync.cycle_start = Some(cycle_start);
            sync.cycle_no
        };
        tdma.sync.pulse();

        send_cal_reply(tdma, dev);
        walk_slots(tdma, dev, cycle_start, cycle_no);

        cycle_start = cycle_start + period;
    }
}

/// Period between the two most recent syncs, once two were heard.
fn estimated_period(tdma: &Tdma) -> Option<Duration> {
    let sync = tdma.sync_state.lock();
    match (sync.prev_sync_rx, sync.last_sync_rx) {
        (Some(prev), Some(last)) if last > prev => {
            Some(Duration::from_nanos((last - prev) as u64))
        }
        _ => None,
    }
}

fn slave_loop(tdma: &Tdma, dev: &DeviceRef) {
    let backup = tdma.flags().contains(TdmaFlags::BACKUP_MASTER);
    let mut seen = tdma.sync.generation();

    loop {
        if tdma.flags().contains(TdmaFlags::SHUTDOWN) {
            return;
        }

        // Sync-miss detection: a backup master waits until its takeover
        // deadline, a plain slave allows half a period of jitter.
        let timeout = if backup {
            let inc = tdma.state.lock().backup_sync_inc;
            (inc != Duration::ZERO).then_some(inc)
        } else {
            estimated_period(tdma).map(|p| p + Duration::from_nanos(p.total_nanos() / 2))
        };

        let (outcome, generation) = tdma.sync.wait_since(seen, timeout);
        let (cycle_start, cycle_no) = match outcome {
            WaitOutcome::Closed => return,
            WaitOutcome::Signaled => {
                seen = generation;
                let sync = tdma.sync_state.lock();
                let Some(start) = sync.cycle_start else {
                    continue;
                };
                (start, sync.cycle_no)
            }
            WaitOutcome::TimedOut => {
                // A backup master can fall back on its configured
                // period; a plain slave only has the observed one.
                let cfg_period = tdma.state.lock().cycle_period;
                let fallback = (backup && cfg_period != Duration::ZERO).then_some(cfg_period);

                let (missed, prediction) = {
                    let mut sync = tdma.sync_state.lock();
                    sync.missed_syncs += 1;
                    let prediction = match estimated(&sync).or(fallback) {
                        Some(period) => {
                            let next = match sync.cycle_start {
                                Some(start) => start + period,
                                None => Instant::now(),
                            };
                            sync.cycle_start = Some(next);
                            sync.cycle_no = sync.cycle_no.wrapping_add(1);
                            Some((next, sync.cycle_no))
                        }
                        None => None,
                    };
                    (sync.missed_syncs, prediction)
                };

                if backup {
                    // Take over: announce our own cycle start.
                    let Some((start, no)) = prediction else {
                        continue;
                    };
                    if !tdma.flags().contains(TdmaFlags::BACKUP_ACTIVE) {
                        net_debug!("tdma: backup master taking over");
                        tdma.set_flag(TdmaFlags::BACKUP_ACTIVE, true);
                    }
                    send_sync(tdma, dev, start);
                    tdma.sync.pulse();
                    seen = tdma.sync.generation();
                    (start, no)
                } else if missed == 1 {
                    // One grace cycle on the predicted schedule.
                    let Some(prediction) = prediction else {
                        continue;
                    };
                    prediction
                } else {
                    if missed == 2 {
                        net_debug!("tdma: sync lost");
                        tdma.set_flag(TdmaFlags::CALIBRATED, false);
                    }
                    continue;
                }
            }
        };

        if tdma.cal_pending() > 0 {
            send_cal_request(tdma, dev);
        }

        walk_slots(tdma, dev, cycle_start, cycle_no);
    }
}

/// `estimated_period` against an already taken lock.
fn estimated(sync: &super::SyncState) -> Option<Duration> {
    match (sync.prev_sync_rx, sync.last_sync_rx) {
        (Some(prev), Some(last)) if last > prev => {
            Some(Duration::from_nanos((last - prev) as u64))
        }
        _ => None,
    }
}
