/*! Time-division multiple access.

TDMA imposes a periodic cycle on a shared link. The acting master opens
every cycle with a sync frame carrying the cycle-start time; slaves
re-anchor their cycle on its reception. All stations then transmit only
inside their configured slots, at most one frame per slot firing, so
within any cycle window at most one station owns the medium.

The worker task is the sole transmitter of an attached device. It walks
the slots in `(offset, id)` order every cycle; configuration changes
splice new slot records in from non-real-time context and quiesce the
old record before freeing it.
*/

mod slot;
mod worker;

pub use self::slot::{Slot, DEFAULT_NRT_SLOT, DEFAULT_SLOT};

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::device::{Device, DeviceRef};
use crate::rtmac::{add_header, MacDiscipline};
use crate::rtskb::{Pool, Rtskb, SkbQueue};
use crate::sys::{spawn_task, PulseEvent, RtEvent, RtLock, WaitOutcome};
use crate::time::{Duration, Instant};
use crate::wire::{
    EthernetAddress, EthernetFrame, RtmacDiscipline, RtmacFrame, TdmaPacket, TdmaRepr,
    RTMAC_HEADER_LEN,
};
use crate::{Error, Result};

/// Largest configurable slot id.
pub const TDMA_MAX_SLOT_ID: usize = 31;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdmaFlags: u32 {
        const MASTER        = 1 << 0;
        const BACKUP_MASTER = 1 << 1;
        const BACKUP_ACTIVE = 1 << 2;
        const CALIBRATED    = 1 << 3;
        const SHUTDOWN      = 1 << 4;
    }
}

/// Configured role of this station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Master,
    Slave,
}

pub(crate) struct ConfigState {
    pub role: Option<Role>,
    pub cycle_period: Duration,
    /// Backup master: silence after which it takes over, counted from
    /// the cycle start (`backup_sync_offset + cycle_period`).
    pub backup_sync_inc: Duration,
    pub max_slot_id: usize,
    /// Slot lookup by id.
    pub slot_table: Vec<Option<Arc<Slot>>>,
    /// The cyclic schedule: slots sorted by `(offset, id)`.
    pub slots: Vec<Arc<Slot>>,
    /// Control-frame pool (sync, calibration).
    pub cal_pool: Option<Pool>,
}

pub(crate) struct SyncState {
    pub cycle_no: u64,
    pub cycle_start: Option<Instant>,
    /// Master clock minus local clock at the last sync reception.
    pub delta_t: i64,
    pub last_sync_rx: Option<Instant>,
    pub prev_sync_rx: Option<Instant>,
    pub missed_syncs: u32,
    /// Station the last sync was heard from.
    pub master_addr: Option<EthernetAddress>,
}

struct CalState {
    pending: u32,
    rounds_done: u32,
    /// Local transmission stamp of the request in flight.
    last_request_tx_ns: i64,
    delay_sum_ns: i64,
    packet_delay_ns: i64,
}

/// One TDMA instance, attached to one device.
pub struct Tdma {
    dev: RtLock<Weak<Device>>,
    flags: RtLock<TdmaFlags>,
    pub(crate) state: RtLock<ConfigState>,
    pub(crate) sync_state: RtLock<SyncState>,
    cal: RtLock<CalState>,
    /// Calibration replies prepared by the master, transmitted by the
    /// worker one per cycle.
    pub(crate) cal_replies: SkbQueue,
    pub(crate) worker_wakeup: RtEvent,
    pub(crate) sync: PulseEvent,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tdma {
    /// Attach a fresh TDMA instance beneath `dev` and start its worker.
    pub fn attach(dev: &DeviceRef) -> Result<Arc<Tdma>> {
        let tdma = Arc::new(Tdma {
            dev: RtLock::new(Arc::downgrade(dev)),
            flags: RtLock::new(TdmaFlags::empty()),
            state: RtLock::new(ConfigState {
                role: None,
                cycle_period: Duration::ZERO,
                backup_sync_inc: Duration::ZERO,
                max_slot_id: 0,
                slot_table: Vec::new(),
                slots: Vec::new(),
                cal_pool: None,
            }),
            sync_state: RtLock::new(SyncState {
                cycle_no: 0,
                cycle_start: None,
                delta_t: 0,
                last_sync_rx: None,
                prev_sync_rx: None,
                missed_syncs: 0,
                master_addr: None,
            }),
            cal: RtLock::new(CalState {
                pending: 0,
                rounds_done: 0,
                last_request_tx_ns: 0,
                delay_sum_ns: 0,
                packet_delay_ns: 0,
            }),
            cal_replies: SkbQueue::new(16),
            worker_wakeup: RtEvent::new(),
            sync: PulseEvent::new(),
            worker: Mutex::new(None),
        });

        dev.attach_mac(tdma.clone())?;

        let worker_tdma = tdma.clone();
        *tdma.worker.lock().unwrap() = Some(spawn_task("rtnet-tdma", move || {
            worker::run(worker_tdma)
        }));

        Ok(tdma)
    }

    pub fn flags(&self) -> TdmaFlags {
        *self.flags.lock()
    }

    pub(crate) fn set_flag(&self, flag: TdmaFlags, on: bool) {
        let mut flags = self.flags.lock();
        if on {
            *flags |= flag;
        } else {
            *flags &= !flag;
        }
    }

    pub(crate) fn device(&self) -> Option<DeviceRef> {
        self.dev.lock().upgrade()
    }

    /// Declare this station the cycle master. A nonzero
    /// `backup_sync_offset_ns` makes it a backup master that stays
    /// silent while the primary is heard.
    pub fn set_master(
        &self,
        cycle_period_ns: u64,
        backup_sync_offset_ns: u64,
        max_slot_id: usize,
        max_cal_requests: usize,
    ) -> Result<()> {
        if cycle_period_ns == 0 || max_slot_id > TDMA_MAX_SLOT_ID {
            return Err(Error::InvalidInput);
        }
        let mut state = self.state.lock();
        if state.role.is_some() {
            return Err(Error::Busy);
        }
        let max_slot_id = max_slot_id.max(1);
        state.role = Some(Role::Master);
        state.cycle_period = Duration::from_nanos(cycle_period_ns);
        state.max_slot_id = max_slot_id;
        state.slot_table = (0..=max_slot_id).map(|_| None).collect();
        state.cal_pool = Some(Pool::new(max_cal_requests.max(2)));
        drop(state);

        self.set_flag(TdmaFlags::MASTER, true);
        if backup_sync_offset_ns != 0 {
            self.set_flag(TdmaFlags::BACKUP_MASTER, true);
            let mut state = self.state.lock();
            let period = state.cycle_period;
            state.backup_sync_inc = Duration::from_nanos(backup_sync_offset_ns) + period;
        }

        self.sync_state.lock().cycle_start = Some(Instant::now());
        self.worker_wakeup.signal();
        Ok(())
    }

    /// Declare this station a slave following a remote master.
    pub fn set_slave(&self, max_slot_id: usize) -> Result<()> {
        if max_slot_id > TDMA_MAX_SLOT_ID {
            return Err(Error::InvalidInput);
        }
        let mut state = self.state.lock();
        if state.role.is_some() {
            return Err(Error::Busy);
        }
        let max_slot_id = max_slot_id.max(1);
        state.role = Some(Role::Slave);
        state.max_slot_id = max_slot_id;
        state.slot_table = (0..=max_slot_id).map(|_| None).collect();
        state.cal_pool = Some(Pool::new(4));
        drop(state);

        self.worker_wakeup.signal();
        Ok(())
    }

    /// Install or replace a slot. The old record is quiesced before it
    /// is freed: the worker drops its reference at the next cycle
    /// boundary.
    pub fn set_slot(
        &self,
        id: usize,
        offset_ns: u64,
        period: u64,
        phasing: u64,
        mtu: usize,
    ) -> Result<()> {
        let slot = Arc::new(Slot::new(
            id,
            Duration::from_nanos(offset_ns),
            period,
            phasing,
            mtu,
        ));

        let old = {
            let mut state = self.state.lock();
            if state.role.is_none() {
                return Err(Error::NotFound);
            }
            if id > state.max_slot_id {
                return Err(Error::InvalidInput);
            }
            let old = state.slot_table[id].take();
            state.slot_table[id] = Some(slot.clone());

            state.slots.retain(|s| s.id != id);
            let at = state
                .slots
                .partition_point(|s| (s.offset, s.id) <= (slot.offset, slot.id));
            state.slots.insert(at, slot);
            old
        };

        if let Some(old) = old {
            while Arc::strong_count(&old) > 1 {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            old.queue.purge();
        }
        Ok(())
    }

    /// Remove a slot, quiescing and draining it.
    pub fn remove_slot(&self, id: usize) -> Result<()> {
        let old = {
            let mut state = self.state.lock();
            if id >= state.slot_table.len() {
                return Err(Error::InvalidInput);
            }
            let old = state.slot_table[id].take().ok_or(Error::NotFound)?;
            state.slots.retain(|s| s.id != id);
            old
        };

        while Arc::strong_count(&old) > 1 {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        old.queue.purge();
        Ok(())
    }

    /// Block until the next cycle start is signalled. The application
    /// hook for cycle-synchronous processing.
    pub fn wait_on_sync(&self, timeout: Option<Duration>) -> Result<()> {
        match self.sync.wait_next(timeout) {
            WaitOutcome::Signaled => Ok(()),
            WaitOutcome::TimedOut => Err(Error::TimedOut),
            WaitOutcome::Closed => Err(Error::NotSocket),
        }
    }

    /// Ask the slave worker to run `rounds` calibration round trips
    /// before raising CALIBRATED.
    pub fn calibrate(&self, rounds: u32) -> Result<()> {
        if rounds == 0 {
            return Err(Error::InvalidInput);
        }
        if self.flags().contains(TdmaFlags::MASTER) {
            return Err(Error::Unsupported);
        }
        self.set_flag(TdmaFlags::CALIBRATED, false);
        let mut cal = self.cal.lock();
        cal.pending = rounds;
        cal.rounds_done = 0;
        cal.delay_sum_ns = 0;
        Ok(())
    }

    /// Measured one-way packet delay after calibration, nanoseconds.
    pub fn packet_delay_ns(&self) -> i64 {
        self.cal.lock().packet_delay_ns
    }

    /// Master clock offset observed at the last sync.
    pub fn delta_t_ns(&self) -> i64 {
        self.sync_state.lock().delta_t
    }

    pub fn cycle_period(&self) -> Duration {
        self.state.lock().cycle_period
    }

    /// Rows for the slot snapshot view: `(id, offset, phasing, period,
    /// mtu)`.
    pub fn slot_rows(&self) -> Vec<(usize, Duration, u64, u64, usize)> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .map(|s| (s.id, s.offset, s.phasing, s.period, s.mtu))
            .collect()
    }

    fn lookup_slot(&self, id: usize) -> Option<Arc<Slot>> {
        let state = self.state.lock();
        let direct = state.slot_table.get(id).cloned().flatten();
        match direct {
            Some(slot) => Some(slot),
            // The non-real-time slot aliases the default slot until it
            // is configured on its own.
            None if id == DEFAULT_NRT_SLOT => {
                state.slot_table.get(DEFAULT_SLOT).cloned().flatten()
            }
            None => state.slot_table.get(DEFAULT_SLOT).cloned().flatten(),
        }
    }

    fn enqueue_tx(&self, skb: Box<Rtskb>, slot_id: usize) -> Result<()> {
        let Some(slot) = self.lookup_slot(slot_id) else {
            skb.free();
            return Err(Error::Again);
        };
        if skb.len() > slot.mtu + EthernetFrame::<&[u8]>::header_len() {
            skb.free();
            return Err(Error::MsgTooLarge);
        }
        slot.queue.enqueue(skb);
        Ok(())
    }

    /// Build one control frame (sync or calibration) from the control
    /// pool.
    pub(crate) fn build_ctrl_frame(
        &self,
        dev: &DeviceRef,
        dst_addr: EthernetAddress,
        repr: TdmaRepr,
    ) -> Result<Box<Rtskb>> {
        let pool = {
            let state = self.state.lock();
            state.cal_pool.clone().ok_or(Error::NetDown)?
        };
        let eth_hlen = EthernetFrame::<&[u8]>::header_len();
        let mut skb = pool.alloc(eth_hlen + RTMAC_HEADER_LEN + repr.buffer_len())?;
        skb.reserve(eth_hlen + RTMAC_HEADER_LEN);
        {
            let region = skb.put(repr.buffer_len());
            repr.emit(&mut TdmaPacket::new_unchecked(&mut *region));
        }
        add_header(dev, dst_addr, &mut skb, RtmacDiscipline::Tdma);
        skb.rtdev = Some(dev.clone());
        Ok(skb)
    }

    fn handle_sync(&self, cycle_start_ns: u64, rx_stamp: Instant, src_addr: EthernetAddress) {
        let flags = self.flags();
        if flags.contains(TdmaFlags::MASTER) && !flags.contains(TdmaFlags::BACKUP_MASTER) {
            // The primary master ignores echoes of its own schedule.
            return;
        }
        if flags.contains(TdmaFlags::BACKUP_MASTER) {
            self.set_flag(TdmaFlags::BACKUP_ACTIVE, false);
        }

        {
            let mut sync = self.sync_state.lock();
            sync.delta_t = cycle_start_ns as i64 - rx_stamp.total_nanos();
            sync.cycle_no = sync.cycle_no.wrapping_add(1);
            sync.cycle_start = Some(rx_stamp);
            sync.prev_sync_rx = sync.last_sync_rx;
            sync.last_sync_rx = Some(rx_stamp);
            sync.missed_syncs = 0;
            sync.master_addr = Some(src_addr);
        }

        // A slave that has no calibration outstanding counts as in sync
        // from the first cycle reference on.
        if self.cal.lock().pending == 0 {
            self.set_flag(TdmaFlags::CALIBRATED, true);
        }

        self.sync.pulse();
    }

    fn handle_cal_request(&self, _tx_stamp_ns: u64, rx_stamp: Instant, requester: EthernetAddress) {
        if !self.flags().contains(TdmaFlags::MASTER) {
            return;
        }
        let Some(dev) = self.device() else { return };
        let repr = TdmaRepr::CalReply {
            request_rx_ns: rx_stamp.total_nanos() as u64,
            // Stamped by the worker right before transmission.
            reply_tx_ns: 0,
        };
        match self.build_ctrl_frame(&dev, requester, repr) {
            Ok(reply) => self.cal_replies.queue_tail(reply),
            Err(err) => net_debug!("tdma: no buffer for calibration reply: {}", err),
        }
    }

    fn handle_cal_reply(&self, request_rx_ns: u64, reply_tx_ns: u64, rx_stamp: Instant) {
        let mut cal = self.cal.lock();
        if cal.pending == 0 {
            return;
        }
        // One-way delay: round trip minus the master's turnaround,
        // halved.
        let turnaround = reply_tx_ns.saturating_sub(request_rx_ns) as i64;
        let rtt = rx_stamp.total_nanos() - cal.last_request_tx_ns - turnaround;
        cal.delay_sum_ns += (rtt / 2).max(0);
        cal.rounds_done += 1;
        cal.pending -= 1;
        if cal.pending == 0 {
            cal.packet_delay_ns = cal.delay_sum_ns / cal.rounds_done.max(1) as i64;
            drop(cal);
            self.set_flag(TdmaFlags::CALIBRATED, true);
        }
    }

    /// Record the local stamp of a calibration request about to leave.
    pub(crate) fn note_cal_request_tx(&self, stamp: Instant) {
        self.cal.lock().last_request_tx_ns = stamp.total_nanos();
    }

    /// Calibration rounds still outstanding.
    pub(crate) fn cal_pending(&self) -> u32 {
        self.cal.lock().pending
    }
}

impl MacDiscipline for Tdma {
    fn name(&self) -> &'static str {
        "TDMA"
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn core::any::Any + Send + Sync> {
        self
    }

    fn rt_packet_tx(&self, skb: Box<Rtskb>, _dev: &DeviceRef) -> Result<()> {
        let slot_id = skb.priority.channel() as usize;
        self.enqueue_tx(skb, slot_id)
    }

    fn nrt_packet_tx(&self, skb: Box<Rtskb>, _dev: &DeviceRef) -> Result<()> {
        self.enqueue_tx(skb, DEFAULT_NRT_SLOT)
    }

    fn packet_rx(&self, skb: Box<Rtskb>, _dev: &DeviceRef) {
        let rx_stamp = skb.rx;

        let Ok(frame) = RtmacFrame::new_checked(skb.payload()) else {
            skb.free();
            return;
        };
        if frame.discipline() != RtmacDiscipline::Tdma {
            net_trace!("tdma: foreign discipline frame, dropped");
            skb.free();
            return;
        }

        let eth_hlen = EthernetFrame::<&[u8]>::header_len();
        let src_addr =
            EthernetFrame::new_unchecked(skb.from_offset(skb.data_offset() - eth_hlen)).src_addr();

        let repr = TdmaPacket::new_checked(frame.payload()).and_then(|p| TdmaRepr::parse(&p));
        match repr {
            Ok(TdmaRepr::Sync { cycle_start_ns }) => {
                self.handle_sync(cycle_start_ns, rx_stamp, src_addr)
            }
            Ok(TdmaRepr::CalRequest { tx_stamp_ns }) => {
                self.handle_cal_request(tx_stamp_ns, rx_stamp, src_addr)
            }
            Ok(TdmaRepr::CalReply {
                request_rx_ns,
                reply_tx_ns,
            }) => self.handle_cal_reply(request_rx_ns, reply_tx_ns, rx_stamp),
            Err(_) => net_debug!("tdma: malformed control frame, dropped"),
        }
        skb.free();
    }

    fn get_mtu(&self, hw_mtu: usize) -> usize {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .map(|slot| slot.mtu)
            .min()
            .unwrap_or(hw_mtu)
            .min(hw_mtu)
    }

    fn detach(&self, dev: &DeviceRef) -> Result<()> {
        self.set_flag(TdmaFlags::SHUTDOWN, true);
        self.worker_wakeup.close();
        self.sync.close();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.cal_replies.purge();

        let (slots, cal_pool) = {
            let mut state = self.state.lock();
            state.slot_table.clear();
            state.role = None;
            (core::mem::take(&mut state.slots), state.cal_pool.take())
        };
        for slot in slots {
            while Arc::strong_count(&slot) > 1 {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            slot.queue.purge();
        }
        if let Some(pool) = cal_pool {
            while !pool.is_full() {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            pool.release();
        }

        dev.detach_mac()?;
        Ok(())
    }
}
