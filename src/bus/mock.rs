//! Scripted I2C bus for driver tests.
//!
//! Tests enqueue the exact transfer sequence a driver is expected to perform;
//! any deviation panics with the offending transfer.

use crate::bus::i2c::{I2cBus, I2cError};
use async_trait::async_trait;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum Transfer {
    /// Expect a read of `response.len()` bytes from `reg`, answered with `response`
    Read {
        address: u8,
        reg: u8,
        response: Vec<u8>,
    },
    /// Expect a write of exactly `data` to `reg`
    Write {
        address: u8,
        reg: u8,
        data: Vec<u8>,
    },
    /// Expect a read answered with a failure
    ReadError { address: u8, reg: u8 },
}

pub struct MockBus {
    expected: VecDeque<Transfer>,
}

impl MockBus {
    pub fn new(transfers: Vec<Transfer>) -> Self {
        Self {
            expected: transfers.into(),
        }
    }

    /// Panics if the driver did not consume every scripted transfer
    pub fn done(&self) {
        assert!(
            self.expected.is_empty(),
            "unconsumed transfers: {:?}",
            self.expected
        );
    }

    fn next(&mut self, what: &str, address: u8, reg: u8) -> Transfer {
        self.expected.pop_front().unwrap_or_else(|| {
            panic!("unexpected {what} at address {address:#04x} reg {reg:#04x}")
        })
    }
}

#[async_trait]
impl I2cBus for MockBus {
    async fn read_bytes(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError> {
        match self.next("read", address, reg) {
            Transfer::Read {
                address: a,
                reg: r,
                response,
            } => {
                assert_eq!((a, r), (address, reg), "read target mismatch");
                assert_eq!(response.len(), buf.len(), "read length mismatch at reg {reg:#04x}");
                buf.copy_from_slice(&response);
                Ok(())
            }
            Transfer::ReadError { address: a, reg: r } => {
                assert_eq!((a, r), (address, reg), "read target mismatch");
                Err(I2cError::Transfer("mock read failure".to_string()))
            }
            other => panic!("expected {other:?}, driver issued read of reg {reg:#04x}"),
        }
    }

    async fn write_bytes(&mut self, address: u8, reg: u8, data: &[u8]) -> Result<(), I2cError> {
        match self.next("write", address, reg) {
            Transfer::Write {
                address: a,
                reg: r,
                data: expected,
            } => {
                assert_eq!((a, r), (address, reg), "write target mismatch");
                assert_eq!(expected, data, "write payload mismatch at reg {reg:#04x}");
                Ok(())
            }
            other => panic!("expected {other:?}, driver issued write of reg {reg:#04x}"),
        }
    }

    async fn read_block(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError> {
        self.read_bytes(address, reg, buf).await
    }
}
