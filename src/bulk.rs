//! Generic USB bulk interface
//!
//! Minimal diagnostic interface on the same two bulk endpoints as the Mass
//! Storage class: every received packet is echoed back to the host, control
//! requests get a dummy answer. The second realization of
//! [UsbInterface](crate::device::UsbInterface), used for bring-up.

use crate::device::controller::{EpAddr, EpState, EpType, UsbController};
use crate::device::{CtrlOutcome, DeviceCore, EpConfig, SetupPacket, UsbInterface};
use crate::fmt::{debug, info};

const BULK_IN_EP: u8 = 1;
const BULK_OUT_EP: u8 = 2;

/// Loopback interface driver
#[derive(Default)]
pub struct BulkLoopback;

impl BulkLoopback {
    pub fn new() -> BulkLoopback {
        BulkLoopback
    }
}

impl<C: UsbController> UsbInterface<C> for BulkLoopback {
    fn reset(&mut self, _bus: &mut DeviceCore<C>) {
        debug!("usb: bulk: reset");
    }

    fn enable(&mut self, bus: &mut DeviceCore<C>, cfg_id: u8) {
        let _ = cfg_id;
        bus.ep_configure(BULK_OUT_EP, EpType::Bulk, EpConfig { rx: true, tx: false });
        bus.ep_configure(BULK_IN_EP, EpType::Bulk, EpConfig { rx: false, tx: true });
        info!("usb: bulk: enabled");
    }

    fn periodic(&mut self, _bus: &mut DeviceCore<C>) {}

    fn ctrl_req(
        &mut self,
        bus: &mut DeviceCore<C>,
        req: &SetupPacket,
        data: Option<&[u8]>,
    ) -> CtrlOutcome {
        if let Some(data) = data {
            debug!("usb: bulk: ctrl data stage, {=usize} bytes", data.len());
            return CtrlOutcome::Handled;
        }

        debug!(
            "usb: bulk: ctrl req={=u8:x} wValue={=u16:x}",
            req.b_request, req.w_value
        );

        // Answer device-to-host requests with a dummy payload
        if req.is_device_to_host() && req.w_length > 0 {
            bus.send(0, &[0x01]);
            return CtrlOutcome::Handled;
        }
        CtrlOutcome::Ack
    }

    fn ep_rx(&mut self, bus: &mut DeviceCore<C>, ep: u8, data: &[u8]) -> EpState {
        debug!("usb: bulk: recv {=usize} bytes on ep{=u8}", data.len(), ep);
        bus.send(BULK_IN_EP, data);
        EpState::Valid
    }

    fn ep_tx_complete(&mut self, _bus: &mut DeviceCore<C>, _ep: u8) -> bool {
        debug!("usb: bulk: tx complete");
        false
    }

    fn ep_release(&mut self, _ep: EpAddr) -> EpState {
        EpState::Valid
    }
}
