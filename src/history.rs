//! Transaction history
//!
//! A history is the ordered list of request/response pairs recovered from a
//! capture. It is built in two passes over a [`PacketSource`]: the destined
//! pass records every request in capture order, the sourced pass pairs each
//! response with the request carrying the same transaction key. A TCP key is
//! the MBAP transaction id; RTU frames carry no id, so each pass numbers its
//! frames and the n-th response is paired with the n-th request.
//!
//! [`Handshake::emulation_data`] flattens one pair into the protocol-neutral
//! [`EmulationData`] that the replay engine applies to a register bank.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::capture::{Direction, PacketSource};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{hex_dump, log_frame};
use crate::protocol::{
    data_utils, ModbusAddress, ModbusFunction, Request, RequestBody, Response, ResponseBody,
    SlaveId, WireMode, COIL_ON,
};
use crate::REGISTER_BANK_SIZE;

/// Key pairing a request with its response
pub type TransactionKey = u64;

/// A request and the response believed to answer it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handshake {
    pub request: Request,
    pub response: Response,
}

impl Handshake {
    /// Pair a request and a response decoded in the same wire mode
    pub fn new(request: Request, response: Response) -> ModbusResult<Self> {
        let (req_mode, resp_mode) = (request.header.wire_mode(), response.header.wire_mode());
        if req_mode != resp_mode {
            return Err(ModbusError::invalid_data(format!(
                "handshake mixes {} request with {} response", req_mode, resp_mode
            )));
        }
        Ok(Self { request, response })
    }

    /// Effective function code of the transaction (the response's)
    pub fn function_id(&self) -> u8 {
        self.response.function_code()
    }

    /// Whether the replay engine may apply this transaction
    pub fn is_valid(&self) -> bool {
        ModbusFunction::is_supported(self.function_id())
    }

    /// Normalize into [`EmulationData`]
    ///
    /// Reads take their values from the response, single writes from the
    /// response echo and multiple writes from the request data, since a
    /// multiple-write response carries no payload. Address and quantity
    /// always come from the request.
    pub fn emulation_data(&self) -> ModbusResult<EmulationData> {
        let function = ModbusFunction::from_u8(self.function_id())?;
        if self.request.function_code() != function.to_u8() {
            return Err(ModbusError::invalid_data(format!(
                "request function 0x{:02X} answered with {}",
                self.request.function_code(), function
            )));
        }

        let address = self.request.address();
        let quantity = self.request.quantity();
        if address as usize + quantity as usize > REGISTER_BANK_SIZE {
            return Err(ModbusError::invalid_address(address, quantity));
        }
        let count = quantity as usize;

        let mut payload: Vec<u16> = match (&self.response.body, &self.request.body) {
            (ResponseBody::ReadBits { status, .. }, _) => {
                if status.len() * 8 < count {
                    return Err(short_payload(function, count, status.len() * 8));
                }
                bits_to_values(&data_utils::unpack_bits(status, count))
            }
            (ResponseBody::ReadRegisters { values, .. }, _) => values.clone(),
            (ResponseBody::WriteSingle { value, .. }, _) => match function {
                ModbusFunction::WriteSingleCoil => vec![u16::from(*value == COIL_ON)],
                _ => vec![*value],
            },
            (ResponseBody::WriteMultiple { .. }, RequestBody::WriteMultiple { data, .. }) => {
                if function.is_bit_function() {
                    if data.len() * 8 < count {
                        return Err(short_payload(function, count, data.len() * 8));
                    }
                    bits_to_values(&data_utils::unpack_bits(data, count))
                } else {
                    data_utils::bytes_to_registers(data)?
                }
            }
            _ => {
                return Err(ModbusError::invalid_data(format!(
                    "{} response does not match its request", function
                )));
            }
        };

        if payload.len() < count {
            return Err(short_payload(function, count, payload.len()));
        }
        payload.truncate(count);

        Ok(EmulationData {
            function_id: function.to_u8(),
            is_read_operation: function.is_write_function(),
            address,
            quantity,
            payload,
        })
    }
}

fn bits_to_values(bits: &[bool]) -> Vec<u16> {
    bits.iter().map(|&bit| u16::from(bit)).collect()
}

fn short_payload(function: ModbusFunction, expected: usize, actual: usize) -> ModbusError {
    ModbusError::invalid_data(format!(
        "{} carries {} items, {} requested", function, actual, expected
    ))
}

/// Protocol-neutral view of one transaction
///
/// `is_read_operation` is set for the write functions (5, 6, 15, 16): their
/// echoed values are taken as the authoritative read-back of the device.
/// Bit payloads hold one 0/1 value per coil or input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmulationData {
    pub function_id: u8,
    pub is_read_operation: bool,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub payload: Vec<u16>,
}

/// One correlated transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEvent {
    pub key: TransactionKey,
    pub slave_id: SlaveId,
    pub handshake: Handshake,
    /// Capture timestamp of the response
    pub observed_time: DateTime<Utc>,
}

/// Ordered transactions of one device socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct History {
    mode: WireMode,
    events: Vec<HistoryEvent>,
}

impl History {
    pub fn new(mode: WireMode, events: Vec<HistoryEvent>) -> Self {
        Self { mode, events }
    }

    pub fn mode(&self) -> WireMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEvent> {
        self.events.get(index)
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Distinct slave ids in ascending order
    pub fn slaves(&self) -> Vec<SlaveId> {
        self.events
            .iter()
            .map(|event| event.slave_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|event| event.observed_time)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|event| event.observed_time)
    }

    /// Index of the last event observed strictly before `timepoint`
    pub fn index_before(&self, timepoint: DateTime<Utc>) -> Option<usize> {
        self.events
            .iter()
            .rposition(|event| event.observed_time < timepoint)
    }
}

/// Assigns transaction keys within one pass
struct KeySequence {
    mode: WireMode,
    next: TransactionKey,
}

impl KeySequence {
    fn new(mode: WireMode) -> Self {
        Self { mode, next: 0 }
    }

    /// RTU frames are numbered whether or not they decode, so that a
    /// malformed frame does not shift the pairing of the frames after it.
    fn next_rtu(&mut self) -> Option<TransactionKey> {
        match self.mode {
            WireMode::RtuOverTcp => {
                let key = self.next;
                self.next += 1;
                Some(key)
            }
            WireMode::Tcp => None,
        }
    }

    fn key(&self, rtu_key: Option<TransactionKey>, transaction_id: Option<u16>) -> TransactionKey {
        rtu_key
            .or(transaction_id.map(TransactionKey::from))
            .unwrap_or_default()
    }
}

struct PendingEvent {
    key: TransactionKey,
    request: Request,
    answer: Option<(Response, DateTime<Utc>)>,
}

/// Build the history of one device socket
///
/// Only failures of the source itself are returned; undecodable frames,
/// orphan responses and unanswered requests are logged and dropped.
pub fn correlate<S: PacketSource + ?Sized>(source: &S, mode: WireMode) -> ModbusResult<History> {
    let mut pending: Vec<PendingEvent> = Vec::new();
    let mut positions: HashMap<TransactionKey, VecDeque<usize>> = HashMap::new();

    let mut keys = KeySequence::new(mode);
    for frame in source.frames(Direction::Destined)? {
        log_frame(Direction::Destined, &frame);
        let rtu_key = keys.next_rtu();
        let request = match Request::decode(mode, &frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "⚠️ Skipping request at {}: {} [{}]",
                    frame.timestamp,
                    e,
                    hex_dump(&frame.payload)
                );
                continue;
            }
        };

        let key = keys.key(rtu_key, request.header.transaction_id());
        positions.entry(key).or_default().push_back(pending.len());
        pending.push(PendingEvent { key, request, answer: None });
    }

    let mut orphans = 0usize;
    let mut keys = KeySequence::new(mode);
    for frame in source.frames(Direction::Sourced)? {
        log_frame(Direction::Sourced, &frame);
        let rtu_key = keys.next_rtu();
        let response = match Response::decode(mode, &frame.payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "⚠️ Skipping response at {}: {} [{}]",
                    frame.timestamp,
                    e,
                    hex_dump(&frame.payload)
                );
                continue;
            }
        };

        let key = keys.key(rtu_key, response.header.transaction_id());
        match positions.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(position) => pending[position].answer = Some((response, frame.timestamp)),
            None => {
                orphans += 1;
                warn!(
                    "⚠️ {}",
                    ModbusError::correlation(format!(
                        "response with key {} at {} has no recorded request", key, frame.timestamp
                    ))
                );
            }
        }
    }

    let recorded = pending.len();
    let mut events = Vec::with_capacity(recorded);
    for PendingEvent { key, request, answer } in pending {
        let Some((response, observed_time)) = answer else {
            debug!("Dropping unanswered request with key {}", key);
            continue;
        };
        let slave_id = request.slave_id();
        match Handshake::new(request, response) {
            Ok(handshake) => events.push(HistoryEvent { key, slave_id, handshake, observed_time }),
            Err(e) => warn!("⚠️ Dropping transaction {}: {}", key, e),
        }
    }

    info!(
        "📜 Correlated {} transactions ({} requests, {} orphan responses, {} unanswered)",
        events.len(), recorded, orphans, recorded - events.len()
    );
    Ok(History::new(mode, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VecSource;
    use chrono::{Duration, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn handshake(mode: WireMode, request: &[u8], response: &[u8]) -> Handshake {
        Handshake::new(
            Request::decode(mode, request).unwrap(),
            Response::decode(mode, response).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_tcp_keys_pair_requests_and_responses() {
        let source = VecSource::new()
            .request(t(0), vec![0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1])
            .request(t(10), vec![0, 2, 0, 0, 0, 6, 1, 1, 0, 0, 0, 1])
            // answered out of order
            .response(t(30), vec![0, 2, 0, 0, 0, 4, 1, 1, 1, 1])
            .response(t(40), vec![0, 1, 0, 0, 0, 5, 1, 3, 2, 0, 7]);

        let history = correlate(&source, WireMode::Tcp).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.mode(), WireMode::Tcp);

        for event in history.events() {
            let request_tid = event.handshake.request.header.transaction_id();
            let response_tid = event.handshake.response.header.transaction_id();
            assert_eq!(request_tid, response_tid);
            assert_eq!(Some(event.key as u16), request_tid);
        }

        // destined order, response timestamps
        assert_eq!(history.get(0).unwrap().key, 1);
        assert_eq!(history.get(0).unwrap().observed_time, t(40));
        assert_eq!(history.get(1).unwrap().key, 2);
        assert_eq!(history.get(1).unwrap().observed_time, t(30));
    }

    #[test]
    fn test_rtu_keys_follow_frame_order() {
        let source = VecSource::new()
            .request(t(0), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A])
            .request(t(100), vec![0x02, 0x06, 0x00, 0x08, 0x00, 0x27, 0x00, 0x00])
            .response(t(5), vec![0x01, 0x03, 0x02, 0x00, 0x05, 0x00, 0x00])
            .response(t(105), vec![0x02, 0x06, 0x00, 0x08, 0x00, 0x27, 0x00, 0x00]);

        let history = correlate(&source, WireMode::RtuOverTcp).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.get(0).unwrap().key, 0);
        assert_eq!(history.get(1).unwrap().key, 1);
        assert_eq!(history.get(1).unwrap().slave_id, 2);
        assert_eq!(history.slaves(), vec![1, 2]);
        assert_eq!(history.start_time(), Some(t(5)));
        assert_eq!(history.end_time(), Some(t(105)));
    }

    #[test]
    fn test_orphans_and_unanswered_requests_are_dropped() {
        let source = VecSource::new()
            .request(t(0), vec![0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1])
            .request(t(10), vec![0, 2, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1])
            // too short, skipped
            .request(t(15), vec![0, 3, 0, 0, 0, 6, 1, 3])
            .response(t(20), vec![0, 9, 0, 0, 0, 5, 1, 3, 2, 0, 1])
            .response(t(25), vec![0, 1, 0, 0, 0, 5, 1, 3, 2, 0, 1])
            // second answer for the same id
            .response(t(26), vec![0, 1, 0, 0, 0, 5, 1, 3, 2, 0, 1]);

        let history = correlate(&source, WireMode::Tcp).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(0).unwrap().key, 1);
    }

    #[test]
    fn test_reused_transaction_id_pairs_in_fifo_order() {
        let source = VecSource::new()
            .request(t(0), vec![0, 7, 0, 0, 0, 6, 1, 6, 0, 1, 0, 10])
            .request(t(100), vec![0, 7, 0, 0, 0, 6, 1, 6, 0, 1, 0, 20])
            .response(t(10), vec![0, 7, 0, 0, 0, 6, 1, 6, 0, 1, 0, 10])
            .response(t(110), vec![0, 7, 0, 0, 0, 6, 1, 6, 0, 1, 0, 20]);

        let history = correlate(&source, WireMode::Tcp).unwrap();
        assert_eq!(history.len(), 2);
        let values: Vec<u16> = history
            .events()
            .iter()
            .map(|event| event.handshake.emulation_data().unwrap().payload[0])
            .collect();
        assert_eq!(values, vec![10, 20]);
        assert_eq!(history.get(1).unwrap().observed_time, t(110));
    }

    #[test]
    fn test_index_before() {
        let source = VecSource::new()
            .request(t(0), vec![0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1])
            .request(t(0), vec![0, 2, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1])
            .request(t(0), vec![0, 3, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1])
            .response(t(100), vec![0, 1, 0, 0, 0, 5, 1, 3, 2, 0, 1])
            .response(t(200), vec![0, 2, 0, 0, 0, 5, 1, 3, 2, 0, 2])
            .response(t(300), vec![0, 3, 0, 0, 0, 5, 1, 3, 2, 0, 3]);

        let history = correlate(&source, WireMode::Tcp).unwrap();
        assert_eq!(history.index_before(t(100)), None);
        assert_eq!(history.index_before(t(150)), Some(0));
        assert_eq!(history.index_before(t(300)), Some(1));
        assert_eq!(history.index_before(t(1000)), Some(2));
    }

    #[test]
    fn test_read_coils_normalization() {
        let hs = handshake(
            WireMode::Tcp,
            &[0, 1, 0, 0, 0, 6, 1, 1, 0, 0, 0, 1],
            &[0, 1, 0, 0, 0, 4, 1, 1, 1, 0],
        );
        let data = hs.emulation_data().unwrap();
        assert_eq!(data.function_id, 1);
        assert!(!data.is_read_operation);
        assert_eq!((data.address, data.quantity), (0, 1));
        assert_eq!(data.payload, vec![0]);
    }

    #[test]
    fn test_write_normalization() {
        let single = handshake(
            WireMode::Tcp,
            &[0, 2, 0, 0, 0, 6, 1, 6, 0, 8, 0, 39],
            &[0, 2, 0, 0, 0, 6, 1, 6, 0, 8, 0, 39],
        );
        let data = single.emulation_data().unwrap();
        assert!(data.is_read_operation);
        assert_eq!((data.address, data.quantity, data.payload.clone()), (8, 1, vec![39]));

        let coil = handshake(
            WireMode::Tcp,
            &[0, 3, 0, 0, 0, 6, 1, 5, 0, 2, 0xFF, 0x00],
            &[0, 3, 0, 0, 0, 6, 1, 5, 0, 2, 0xFF, 0x00],
        );
        assert_eq!(coil.emulation_data().unwrap().payload, vec![1]);

        let multiple = handshake(
            WireMode::Tcp,
            &[0, 4, 0, 0, 0, 8, 1, 15, 0, 4, 0, 4, 1, 0b0000_1011],
            &[0, 4, 0, 0, 0, 6, 1, 15, 0, 4, 0, 4],
        );
        let data = multiple.emulation_data().unwrap();
        assert_eq!(data.function_id, 15);
        assert_eq!((data.address, data.quantity), (4, 4));
        assert_eq!(data.payload, vec![1, 1, 0, 1]);
    }

    #[test]
    fn test_invalid_transactions() {
        let exception = handshake(
            WireMode::Tcp,
            &[0, 5, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1],
            &[0, 5, 0, 0, 0, 3, 1, 0x83, 0x02],
        );
        assert!(!exception.is_valid());
        assert_eq!(exception.function_id(), 0x83);
        assert_eq!(exception.emulation_data().unwrap_err(), ModbusError::invalid_function(0x83));

        let out_of_range = handshake(
            WireMode::Tcp,
            &[0, 6, 0, 0, 0, 6, 1, 3, 0xFF, 0xFF, 0, 2],
            &[0, 6, 0, 0, 0, 7, 1, 3, 4, 0, 1, 0, 2],
        );
        assert!(out_of_range.is_valid());
        assert_eq!(
            out_of_range.emulation_data().unwrap_err(),
            ModbusError::invalid_address(0xFFFF, 2)
        );

        let short = handshake(
            WireMode::Tcp,
            &[0, 7, 0, 0, 0, 6, 1, 3, 0, 0, 0, 3],
            &[0, 7, 0, 0, 0, 5, 1, 3, 2, 0, 1],
        );
        assert!(matches!(short.emulation_data(), Err(ModbusError::InvalidData { .. })));
    }

    #[test]
    fn test_mixed_mode_handshake_is_rejected() {
        let request =
            Request::decode(WireMode::Tcp, &[0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1]).unwrap();
        let rtu = [0x01, 0x03, 0x02, 0x00, 0x05, 0x00, 0x00];
        let response = Response::decode(WireMode::RtuOverTcp, &rtu).unwrap();
        assert!(Handshake::new(request, response).is_err());
    }
}
