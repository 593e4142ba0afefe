use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::error::{CoreError, Result};

/// Physical-layer parameters of one LoRa transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoraParams {
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
    /// Coding rate denominator offset: 1..=4 maps to 4/5..4/8.
    pub coding_rate: u8,
    pub preamble_symbols: u16,
    pub explicit_header: bool,
    pub crc_enabled: bool,
}

impl LoraParams {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            spreading_factor: config.spreading_factor,
            bandwidth_khz: config.bandwidth_khz,
            coding_rate: config.coding_rate,
            preamble_symbols: config.preamble_symbols,
            explicit_header: true,
            crc_enabled: true,
        }
    }

    /// Low data rate optimization is mandated for slow symbol rates
    /// (SF11/SF12 at 125 kHz).
    pub fn low_data_rate_optimization(&self) -> bool {
        self.spreading_factor >= 11 && self.bandwidth_khz == 125
    }
}

/// On-air duration of a frame, from the LoRa airtime formula.
///
/// ```text
/// t_sym      = 2^SF / BW
/// t_preamble = (n_preamble + 4.25) · t_sym
/// n_payload  = 8 + max(ceil((8·PL − 4·SF + 28 + 16·CRC − 20·IH)
///                           / (4·(SF − 2·DE))) · (CR + 4), 0)
/// airtime    = t_preamble + n_payload · t_sym
/// ```
pub fn airtime_ms(params: &LoraParams, payload_len: usize) -> f64 {
    let sf = params.spreading_factor as f64;
    let bw_hz = params.bandwidth_khz as f64 * 1_000.0;
    let t_sym_s = (2f64).powf(sf) / bw_hz;

    let t_preamble_s = (params.preamble_symbols as f64 + 4.25) * t_sym_s;

    let pl = payload_len as f64;
    let crc = if params.crc_enabled { 1.0 } else { 0.0 };
    let ih = if params.explicit_header { 0.0 } else { 1.0 };
    let de = if params.low_data_rate_optimization() {
        1.0
    } else {
        0.0
    };
    let cr = params.coding_rate as f64;

    let numerator = 8.0 * pl - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * ih;
    let denominator = 4.0 * (sf - 2.0 * de);
    let n_payload = 8.0 + ((numerator / denominator).ceil() * (cr + 4.0)).max(0.0);

    (t_preamble_s + n_payload * t_sym_s) * 1_000.0
}

/// Link metadata attached to every received frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxMeta {
    pub rssi_dbm: i16,
    pub snr_db: f32,
}

impl RxMeta {
    /// Map RSSI/SNR onto a [0, 1] link quality estimate. −30 dBm is a
    /// perfect link, −120 dBm is the noise floor.
    pub fn link_quality(&self) -> f64 {
        let rssi_component = ((self.rssi_dbm as f64 + 120.0) / 90.0).clamp(0.0, 1.0);
        let snr_component = ((self.snr_db as f64 + 20.0) / 30.0).clamp(0.0, 1.0);
        (rssi_component * 0.6 + snr_component * 0.4).clamp(0.0, 1.0)
    }
}

/// The radio hardware seam. Drivers live outside this crate; tests and
/// the demo binary use [`ChannelRadio`].
pub trait TransmissionPort: Send + Sync {
    /// Transmit one frame; returns the airtime actually consumed in ms.
    fn transmit(
        &self,
        frame: &[u8],
        frequency_mhz: f64,
        params: &LoraParams,
        power_dbm: i8,
    ) -> Result<u64>;

    /// Poll for a received frame; `None` when the queue is empty.
    fn receive(&self) -> Option<(Vec<u8>, RxMeta)>;
}

/// In-process radio: every endpoint attached to a hub hears every other
/// endpoint's transmissions, like nodes sharing a channel.
pub struct ChannelHub {
    endpoints: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> ChannelRadio {
        let (tx, rx) = mpsc::channel();
        let index = {
            let mut endpoints = self.endpoints.lock();
            endpoints.push(tx);
            endpoints.len() - 1
        };
        ChannelRadio {
            hub: self.clone(),
            index,
            rx: Mutex::new(rx),
        }
    }

    fn broadcast_from(&self, sender_index: usize, frame: &[u8]) {
        let endpoints = self.endpoints.lock();
        for (i, tx) in endpoints.iter().enumerate() {
            if i != sender_index {
                let _ = tx.send(frame.to_vec());
            }
        }
    }
}

/// One endpoint of a [`ChannelHub`].
pub struct ChannelRadio {
    hub: Arc<ChannelHub>,
    index: usize,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl TransmissionPort for ChannelRadio {
    fn transmit(
        &self,
        frame: &[u8],
        _frequency_mhz: f64,
        params: &LoraParams,
        _power_dbm: i8,
    ) -> Result<u64> {
        if frame.is_empty() {
            return Err(CoreError::Protocol("empty frame".into()));
        }
        self.hub.broadcast_from(self.index, frame);
        Ok(airtime_ms(params, frame.len()).ceil() as u64)
    }

    fn receive(&self) -> Option<(Vec<u8>, RxMeta)> {
        self.rx.lock().try_recv().ok().map(|bytes| {
            (
                bytes,
                RxMeta {
                    rssi_dbm: -60,
                    snr_db: 8.0,
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf7() -> LoraParams {
        LoraParams {
            spreading_factor: 7,
            bandwidth_khz: 125,
            coding_rate: 1,
            preamble_symbols: 8,
            explicit_header: true,
            crc_enabled: true,
        }
    }

    #[test]
    fn test_airtime_reference_value() {
        // SF7/125kHz/CR4-5, 8-symbol preamble, explicit header + CRC,
        // 20-byte payload: t_sym = 1.024 ms, preamble 12.544 ms,
        // 43 payload symbols = 44.032 ms → 56.576 ms total.
        let t = airtime_ms(&sf7(), 20);
        assert!((56.0..57.5).contains(&t), "got {}", t);
    }

    #[test]
    fn test_airtime_grows_with_payload_and_sf() {
        assert!(airtime_ms(&sf7(), 200) > airtime_ms(&sf7(), 20));
        let mut sf12 = sf7();
        sf12.spreading_factor = 12;
        assert!(airtime_ms(&sf12, 20) > 10.0 * airtime_ms(&sf7(), 20));
    }

    #[test]
    fn test_low_data_rate_optimization_threshold() {
        let mut p = sf7();
        assert!(!p.low_data_rate_optimization());
        p.spreading_factor = 11;
        assert!(p.low_data_rate_optimization());
        p.bandwidth_khz = 250;
        assert!(!p.low_data_rate_optimization());
    }

    #[test]
    fn test_link_quality_ordering() {
        let strong = RxMeta {
            rssi_dbm: -50,
            snr_db: 10.0,
        };
        let weak = RxMeta {
            rssi_dbm: -115,
            snr_db: -15.0,
        };
        assert!(strong.link_quality() > weak.link_quality());
        assert!((0.0..=1.0).contains(&weak.link_quality()));
    }

    #[test]
    fn test_hub_broadcasts_to_others_only() {
        let hub = ChannelHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let c = hub.endpoint();

        a.transmit(b"frame", 868.1, &sf7(), 14).unwrap();
        assert!(a.receive().is_none(), "sender must not hear itself");
        assert_eq!(b.receive().unwrap().0, b"frame");
        assert_eq!(c.receive().unwrap().0, b"frame");
    }

    #[test]
    fn test_transmit_returns_airtime() {
        let hub = ChannelHub::new();
        let a = hub.endpoint();
        let _b = hub.endpoint();
        let duration = a.transmit(&[0u8; 100], 868.1, &sf7(), 14).unwrap();
        assert!(duration > 0);
    }
}
