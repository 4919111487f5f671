pub mod i2c;

#[cfg(test)]
pub mod mock;
