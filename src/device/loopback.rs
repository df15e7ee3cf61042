//! Software loopback: every transmitted frame immediately re-enters the
//! device's receive queue.

use super::{DeviceRef, Driver, TxResult};
use crate::rtskb::Rtskb;
use crate::Result;

#[derive(Debug, Default)]
pub struct Loopback {
    _priv: (),
}

impl Loopback {
    pub fn new() -> Loopback {
        Loopback { _priv: () }
    }
}

impl Driver for Loopback {
    fn open(&mut self, _dev: &DeviceRef) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _dev: &DeviceRef) -> Result<()> {
        Ok(())
    }

    fn hard_start_xmit(&mut self, skb: Box<Rtskb>, dev: &DeviceRef) -> TxResult {
        dev.stats.count_rx(skb.len());
        dev.netif_rx(skb);
        dev.rx_mark();
        Ok(())
    }
}
