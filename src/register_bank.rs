/// Emulated Modbus memory
///
/// A register bank holds the four Modbus memory classes of one slave as
/// fixed arrays covering the whole 16-bit address space. Clones share the
/// same backing arrays, so the replay engine and the network listener of a
/// server always see identical data.

use log::debug;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use crate::error::{ModbusError, ModbusResult};
use crate::history::EmulationData;
use crate::protocol::{ModbusAddress, ModbusFunction, SlaveId};
use crate::REGISTER_BANK_SIZE;

type Table<T> = Arc<RwLock<Vec<T>>>;

/// Coils, discrete inputs, holding registers and input registers of one slave
///
/// All operations use 0-based addressing and reject ranges that run past
/// address 65535.
#[derive(Debug, Clone)]
pub struct RegisterBank {
    /// Coils (read/write) - 1 bit each
    coils: Table<bool>,
    /// Discrete inputs (read-only on the wire) - 1 bit each
    discrete_inputs: Table<bool>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: Table<u16>,
    /// Input registers (read-only on the wire) - 16 bits each
    input_registers: Table<u16>,
}

impl RegisterBank {
    /// Create a zero-initialized register bank
    pub fn new() -> Self {
        Self {
            coils: table(false),
            discrete_inputs: table(false),
            holding_registers: table(0),
            input_registers: table(0),
        }
    }

    pub fn read_coils(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_range(&self.coils, "coils", address, quantity)
    }

    pub fn read_discrete_inputs(
        &self,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        read_range(&self.discrete_inputs, "discrete inputs", address, quantity)
    }

    pub fn read_holding_registers(
        &self,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        read_range(&self.holding_registers, "holding registers", address, quantity)
    }

    pub fn read_input_registers(
        &self,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        read_range(&self.input_registers, "input registers", address, quantity)
    }

    /// Write single coil (function code 0x05)
    pub fn write_coil(&self, address: ModbusAddress, value: bool) -> ModbusResult<()> {
        write_range(&self.coils, "coils", address, &[value])
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_coils(&self, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        write_range(&self.coils, "coils", address, values)
    }

    /// Write single register (function code 0x06)
    pub fn write_register(&self, address: ModbusAddress, value: u16) -> ModbusResult<()> {
        write_range(&self.holding_registers, "holding registers", address, &[value])
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_registers(&self, address: ModbusAddress, values: &[u16]) -> ModbusResult<()> {
        write_range(&self.holding_registers, "holding registers", address, values)
    }

    /// Seed discrete inputs, which clients cannot write
    pub fn set_discrete_inputs(&self, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        write_range(&self.discrete_inputs, "discrete inputs", address, values)
    }

    /// Seed input registers, which clients cannot write
    pub fn set_input_registers(&self, address: ModbusAddress, values: &[u16]) -> ModbusResult<()> {
        write_range(&self.input_registers, "input registers", address, values)
    }

    /// Apply one replayed transaction
    ///
    /// Reads bring the addressed slice in line with the observed values and
    /// leave it untouched when it already matches. Writes overwrite their
    /// range unconditionally. Returns whether the bank changed.
    pub fn apply(&self, data: &EmulationData) -> ModbusResult<bool> {
        let function = ModbusFunction::from_u8(data.function_id)?;
        let address = data.address;
        let words = &data.payload[..];

        if function.is_write_function() && words.is_empty() {
            return Err(ModbusError::invalid_data(format!("{} without payload", function)));
        }

        match function {
            ModbusFunction::ReadCoils => sync_range(&self.coils, "coils", address, &to_bits(words)),
            ModbusFunction::ReadDiscreteInputs => {
                sync_range(&self.discrete_inputs, "discrete inputs", address, &to_bits(words))
            }
            ModbusFunction::ReadHoldingRegisters => {
                sync_range(&self.holding_registers, "holding registers", address, words)
            }
            ModbusFunction::ReadInputRegisters => {
                sync_range(&self.input_registers, "input registers", address, words)
            }
            ModbusFunction::WriteSingleCoil => {
                self.write_coil(address, words[0] != 0).map(|_| true)
            }
            ModbusFunction::WriteSingleRegister => {
                self.write_register(address, words[0]).map(|_| true)
            }
            ModbusFunction::WriteMultipleCoils => {
                self.write_coils(address, &to_bits(words)).map(|_| true)
            }
            ModbusFunction::WriteMultipleRegisters => {
                self.write_registers(address, words).map(|_| true)
            }
        }
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

fn table<T: Clone>(initial: T) -> Table<T> {
    Arc::new(RwLock::new(vec![initial; REGISTER_BANK_SIZE]))
}

fn to_bits(words: &[u16]) -> Vec<bool> {
    words.iter().map(|&word| word != 0).collect()
}

fn check_range(address: ModbusAddress, count: usize) -> ModbusResult<std::ops::Range<usize>> {
    let start = address as usize;
    let end = start + count;
    if end > REGISTER_BANK_SIZE {
        return Err(ModbusError::invalid_address(address, count.min(u16::MAX as usize) as u16));
    }
    Ok(start..end)
}

fn read_range<T: Copy>(
    table: &Table<T>,
    name: &str,
    address: ModbusAddress,
    quantity: u16,
) -> ModbusResult<Vec<T>> {
    let range = check_range(address, quantity as usize)?;
    let values = table
        .read()
        .map_err(|_| ModbusError::internal(format!("Failed to lock {}", name)))?;
    Ok(values[range].to_vec())
}

fn write_range<T: Copy>(
    table: &Table<T>,
    name: &str,
    address: ModbusAddress,
    new: &[T],
) -> ModbusResult<()> {
    let range = check_range(address, new.len())?;
    let mut values = table
        .write()
        .map_err(|_| ModbusError::internal(format!("Failed to lock {}", name)))?;
    values[range].copy_from_slice(new);
    Ok(())
}

/// Overwrite `[address, address + new.len())` only when it differs
fn sync_range<T: Copy + PartialEq + Debug>(
    table: &Table<T>,
    name: &str,
    address: ModbusAddress,
    new: &[T],
) -> ModbusResult<bool> {
    let range = check_range(address, new.len())?;

    {
        let values = table
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", name)))?;
        if values[range.clone()] == *new {
            return Ok(false);
        }
    }

    let mut values = table
        .write()
        .map_err(|_| ModbusError::internal(format!("Failed to lock {}", name)))?;
    debug!(
        "🔄 {} [{}..{}]: {:?} -> {:?}",
        name,
        range.start,
        range.end,
        &values[range.clone()],
        new
    );
    values[range].copy_from_slice(new);
    Ok(true)
}

/// Register banks of one emulated server, keyed by slave id
#[derive(Debug, Clone, Default)]
pub struct SlaveBanks {
    banks: BTreeMap<SlaveId, RegisterBank>,
}

impl SlaveBanks {
    /// One fresh bank per slave id
    pub fn for_slaves(slaves: &[SlaveId]) -> Self {
        Self {
            banks: slaves.iter().map(|&slave| (slave, RegisterBank::new())).collect(),
        }
    }

    pub fn get(&self, slave: SlaveId) -> Option<&RegisterBank> {
        self.banks.get(&slave)
    }

    pub fn slaves(&self) -> Vec<SlaveId> {
        self.banks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(function_id: u8, address: u16, payload: Vec<u16>) -> EmulationData {
        EmulationData {
            function_id,
            is_read_operation: matches!(function_id, 5 | 6 | 15 | 16),
            address,
            quantity: payload.len() as u16,
            payload,
        }
    }

    #[test]
    fn test_coil_operations() {
        let bank = RegisterBank::new();

        bank.write_coil(10, true).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_input_tables() {
        let bank = RegisterBank::new();

        bank.set_discrete_inputs(10, &[true, true, false]).unwrap();
        assert_eq!(bank.read_discrete_inputs(10, 3).unwrap(), vec![true, true, false]);
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![false]);

        bank.set_input_registers(30, &[7, 8]).unwrap();
        assert_eq!(bank.read_input_registers(30, 2).unwrap(), vec![7, 8]);
        assert_eq!(bank.read_holding_registers(30, 1).unwrap(), vec![0]);

        assert!(bank.set_input_registers(65535, &[1, 2]).is_err());
    }

    #[test]
    fn test_register_operations() {
        let bank = RegisterBank::new();

        bank.write_register(5, 42).unwrap();
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![42]);

        bank.write_registers(100, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holding_registers(100, 3).unwrap(), vec![100, 200, 300]);
    }

    #[test]
    fn test_range_limits() {
        let bank = RegisterBank::new();
        assert_eq!(bank.read_holding_registers(65535, 1).unwrap(), vec![0]);
        assert!(bank.read_holding_registers(65535, 2).is_err());
        assert!(bank.write_coils(65530, &[true; 7]).is_err());
        assert!(bank.apply(&data(16, 65535, vec![1, 2])).is_err());
    }

    #[test]
    fn test_apply_scenarios() {
        let bank = RegisterBank::new();

        assert!(!bank.apply(&data(1, 0, vec![0])).unwrap());
        assert_eq!(bank.read_coils(0, 1).unwrap(), vec![false]);

        assert!(bank.apply(&data(6, 8, vec![39])).unwrap());
        assert_eq!(bank.read_holding_registers(8, 1).unwrap(), vec![39]);

        assert!(bank.apply(&data(15, 4, vec![1, 1, 0, 1])).unwrap());
        assert_eq!(bank.read_coils(4, 4).unwrap(), vec![true, true, false, true]);
    }

    #[test]
    fn test_multiple_write_ignores_prior_contents() {
        let bank = RegisterBank::new();
        bank.write_coils(4, &[false, false, true, false]).unwrap();

        bank.apply(&data(15, 4, vec![1, 1, 0, 1])).unwrap();
        assert_eq!(bank.read_coils(4, 4).unwrap(), vec![true, true, false, true]);
    }

    #[test]
    fn test_read_sync_is_idempotent() {
        let bank = RegisterBank::new();
        bank.write_register(0, 17).unwrap();

        assert!(bank.apply(&data(3, 0, vec![0])).unwrap());
        assert_eq!(bank.read_holding_registers(0, 1).unwrap(), vec![0]);
        assert!(!bank.apply(&data(3, 0, vec![0])).unwrap());

        assert!(bank.apply(&data(4, 2, vec![5, 6])).unwrap());
        assert_eq!(bank.read_input_registers(2, 2).unwrap(), vec![5, 6]);

        assert!(bank.apply(&data(2, 7, vec![1])).unwrap());
        assert_eq!(bank.read_discrete_inputs(7, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_clones_share_storage() {
        let bank = RegisterBank::new();
        let listener_view = bank.clone();
        bank.apply(&data(6, 3, vec![7])).unwrap();
        assert_eq!(listener_view.read_holding_registers(3, 1).unwrap(), vec![7]);
    }

    #[test]
    fn test_slave_banks() {
        let banks = SlaveBanks::for_slaves(&[3, 1]);
        assert_eq!(banks.slaves(), vec![1, 3]);
        assert_eq!(banks.len(), 2);
        assert!(banks.get(2).is_none());
        banks.get(1).unwrap().write_register(0, 1).unwrap();
        assert_eq!(banks.get(3).unwrap().read_holding_registers(0, 1).unwrap(), vec![0]);
    }
}
