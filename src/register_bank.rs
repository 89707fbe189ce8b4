/// Modbus register bank for one gateway's address space
///
/// This module provides storage for coils, discrete inputs, holding registers,
/// and input registers. All four banks sit behind a single exclusive guard:
/// the outward sync pass, client reads, and client writes all take the same
/// lock, so a two-register value is never observable half-written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use crate::error::{GatewayError, GatewayResult};
use crate::model::RegisterType;
use crate::utils::validation;

/// The four data banks of one address space
///
/// Addresses are 0-based. Unset addresses read as `false` / `0`.
#[derive(Debug, Default)]
pub struct RegisterFile {
    /// Coils (read/write) - 1 bit each
    coils: HashMap<u16, bool>,
    /// Discrete inputs (read-only for clients) - 1 bit each
    discrete_inputs: HashMap<u16, bool>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: HashMap<u16, u16>,
    /// Input registers (read-only for clients) - 16 bits each
    input_registers: HashMap<u16, u16>,
}

impl RegisterFile {
    fn bits(&self, bank: RegisterType) -> GatewayResult<&HashMap<u16, bool>> {
        match bank {
            RegisterType::Coil => Ok(&self.coils),
            RegisterType::DiscreteInput => Ok(&self.discrete_inputs),
            _ => Err(GatewayError::internal(format!("{} is not a bit bank", bank))),
        }
    }

    fn bits_mut(&mut self, bank: RegisterType) -> GatewayResult<&mut HashMap<u16, bool>> {
        match bank {
            RegisterType::Coil => Ok(&mut self.coils),
            RegisterType::DiscreteInput => Ok(&mut self.discrete_inputs),
            _ => Err(GatewayError::internal(format!("{} is not a bit bank", bank))),
        }
    }

    fn words(&self, bank: RegisterType) -> GatewayResult<&HashMap<u16, u16>> {
        match bank {
            RegisterType::HoldingRegister => Ok(&self.holding_registers),
            RegisterType::InputRegister => Ok(&self.input_registers),
            _ => Err(GatewayError::internal(format!("{} is not a word bank", bank))),
        }
    }

    fn words_mut(&mut self, bank: RegisterType) -> GatewayResult<&mut HashMap<u16, u16>> {
        match bank {
            RegisterType::HoldingRegister => Ok(&mut self.holding_registers),
            RegisterType::InputRegister => Ok(&mut self.input_registers),
            _ => Err(GatewayError::internal(format!("{} is not a word bank", bank))),
        }
    }

    /// Read `quantity` bits from a coil or discrete-input bank
    pub fn read_bits(&self, bank: RegisterType, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        validation::validate_address_range(address, quantity)?;
        let bits = self.bits(bank)?;
        Ok((0..quantity)
            .map(|i| bits.get(&(address + i)).copied().unwrap_or(false))
            .collect())
    }

    /// Write consecutive bits into a coil or discrete-input bank
    pub fn write_bits(&mut self, bank: RegisterType, address: u16, values: &[bool]) -> GatewayResult<()> {
        validation::validate_address_range(address, values.len() as u16)?;
        let bits = self.bits_mut(bank)?;
        for (i, &value) in values.iter().enumerate() {
            bits.insert(address + i as u16, value);
        }
        Ok(())
    }

    /// Read `quantity` registers from a holding or input bank
    pub fn read_words(&self, bank: RegisterType, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        validation::validate_address_range(address, quantity)?;
        let words = self.words(bank)?;
        Ok((0..quantity)
            .map(|i| words.get(&(address + i)).copied().unwrap_or(0))
            .collect())
    }

    /// Write consecutive registers into a holding or input bank
    pub fn write_words(&mut self, bank: RegisterType, address: u16, values: &[u16]) -> GatewayResult<()> {
        validation::validate_address_range(address, values.len() as u16)?;
        let words = self.words_mut(bank)?;
        for (i, &value) in values.iter().enumerate() {
            words.insert(address + i as u16, value);
        }
        Ok(())
    }

    /// Populated address counts per bank
    pub fn stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            coils_count: self.coils.len(),
            discrete_inputs_count: self.discrete_inputs.len(),
            holding_registers_count: self.holding_registers.len(),
            input_registers_count: self.input_registers.len(),
        }
    }
}

/// Shared handle to one gateway's register file
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    inner: Arc<Mutex<RegisterFile>>,
}

impl RegisterBank {
    /// Create a new register bank with empty data
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the exclusive guard
    ///
    /// Hold the guard across every mutation that must appear atomic to
    /// clients, e.g. a whole sync pass.
    ///
    /// A guard dropped by a panicking thread does not take the bank down;
    /// the next sync pass rewrites whatever it left behind.
    pub fn lock(&self) -> GatewayResult<MutexGuard<'_, RegisterFile>> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        self.lock()?.read_bits(RegisterType::Coil, address, quantity)
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        self.lock()?.read_bits(RegisterType::DiscreteInput, address, quantity)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        self.lock()?.read_words(RegisterType::HoldingRegister, address, quantity)
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        self.lock()?.read_words(RegisterType::InputRegister, address, quantity)
    }

    /// Write single coil (function code 0x05)
    pub fn write_single_coil(&self, address: u16, value: bool) -> GatewayResult<()> {
        self.lock()?.write_bits(RegisterType::Coil, address, &[value])
    }

    /// Write single register (function code 0x06)
    pub fn write_single_register(&self, address: u16, value: u16) -> GatewayResult<()> {
        self.lock()?.write_words(RegisterType::HoldingRegister, address, &[value])
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_multiple_coils(&self, address: u16, values: &[bool]) -> GatewayResult<()> {
        self.lock()?.write_bits(RegisterType::Coil, address, values)
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_multiple_registers(&self, address: u16, values: &[u16]) -> GatewayResult<()> {
        self.lock()?.write_words(RegisterType::HoldingRegister, address, values)
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> GatewayResult<RegisterBankStats> {
        Ok(self.lock()?.stats())
    }
}

/// Register bank statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_operations() {
        let bank = RegisterBank::new();

        bank.write_single_coil(10, true).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_multiple_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);
        assert_eq!(bank.read_discrete_inputs(20, 3).unwrap(), vec![false, false, false]);
    }

    #[test]
    fn test_register_operations() {
        let bank = RegisterBank::new();

        bank.write_single_register(5, 42).unwrap();
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![42]);

        bank.write_multiple_registers(100, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holding_registers(100, 3).unwrap(), vec![100, 200, 300]);
        assert_eq!(bank.read_input_registers(100, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_read_only_banks_through_guard() {
        let bank = RegisterBank::new();
        {
            let mut file = bank.lock().unwrap();
            file.write_words(RegisterType::InputRegister, 7, &[0x41BC, 0x0000]).unwrap();
            file.write_bits(RegisterType::DiscreteInput, 3, &[true]).unwrap();
        }
        assert_eq!(bank.read_input_registers(7, 2).unwrap(), vec![0x41BC, 0x0000]);
        assert_eq!(bank.read_discrete_inputs(3, 1).unwrap(), vec![true]);

        let stats = bank.get_stats().unwrap();
        assert_eq!(stats.input_registers_count, 2);
        assert_eq!(stats.discrete_inputs_count, 1);
    }

    #[test]
    fn test_address_space_bounds() {
        let bank = RegisterBank::new();
        assert!(bank.write_multiple_registers(65535, &[1, 2]).is_err());
        assert!(bank.write_single_register(65535, 1).is_ok());
        assert!(matches!(
            bank.read_holding_registers(65530, 10),
            Err(GatewayError::InvalidAddress { .. })
        ));

        let mut file = bank.lock().unwrap();
        assert!(file.write_words(RegisterType::Coil, 0, &[1]).is_err());
    }

    #[test]
    fn test_bank_usable_after_panic_under_guard() {
        let bank = RegisterBank::new();
        bank.write_single_register(2, 11).unwrap();

        let shared = bank.clone();
        let result = std::thread::spawn(move || {
            let mut file = shared.lock().unwrap();
            file.write_words(RegisterType::HoldingRegister, 2, &[22]).unwrap();
            panic!("sync pass aborted");
        })
        .join();
        assert!(result.is_err());

        assert_eq!(bank.read_holding_registers(2, 1).unwrap(), vec![22]);
        bank.write_single_coil(0, true).unwrap();
        assert_eq!(bank.read_coils(0, 1).unwrap(), vec![true]);
    }
}
