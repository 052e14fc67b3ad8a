//! Boundary to the host IPsec/XFRM collaborator.
//!
//! The engines only validate the key material and forward the parameters of
//! one transport-mode ESP state and policy. Installing the state (netlink
//! XFRM or otherwise) is the business of an injected [`EspProvisioner`].

use crate::tools::error::{FluteError, Result};
use std::net::IpAddr;

/// Traffic direction of the ESP policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Cipher installed for the ESP state
pub const ESP_ALGORITHM: &str = "aes";

/// Upper bound for the decoded key material
pub const MAX_KEY_LEN: usize = 64;

/// Decoded AES key material
#[derive(Clone)]
pub struct EspKey(Vec<u8>);

impl EspKey {
    /// Decode an hexadecimal key, at most [`MAX_KEY_LEN`] bytes
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| FluteError::Config(format!("invalid hexadecimal key: {}", e)))?;
        if bytes.is_empty() || bytes.len() > MAX_KEY_LEN {
            return Err(FluteError::Config(format!(
                "key length {} is outside 1..={} bytes",
                bytes.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(EspKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EspKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("EspKey").field("len", &self.0.len()).finish()
    }
}

///
/// Installs one transport-mode ESP state and policy with
/// `src=ANY, dst=dest_address/32, proto=ESP, reqid=spi` and the
/// [`ESP_ALGORITHM`] cipher.
///
pub trait EspProvisioner: Send + Sync {
    fn enable_esp(
        &self,
        spi: u32,
        dest_address: IpAddr,
        direction: Direction,
        key: &EspKey,
    ) -> Result<()>;
}

/// Validate the key and delegate to the provisioner
pub fn enable_esp(
    provisioner: Option<&dyn EspProvisioner>,
    spi: u32,
    dest_address: IpAddr,
    direction: Direction,
    hex_key: &str,
) -> Result<()> {
    let key = EspKey::from_hex(hex_key)?;
    match provisioner {
        Some(provisioner) => provisioner.enable_esp(spi, dest_address, direction, &key),
        None => Err(FluteError::Config(
            "no ESP provisioner is configured".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_esp_key_decoding() {
        crate::tests::init();
        assert_eq!(
            EspKey::from_hex("000102030405060708090a0b0c0d0e0f")
                .unwrap()
                .as_bytes()
                .len(),
            16
        );
        assert!(EspKey::from_hex("zz").is_err());
        assert!(EspKey::from_hex("").is_err());
        // 65 bytes is one too many
        assert!(EspKey::from_hex(&"00".repeat(65)).is_err());
        assert!(EspKey::from_hex(&"00".repeat(64)).is_ok());
    }

    #[test]
    pub fn test_esp_without_provisioner() {
        crate::tests::init();
        let res = enable_esp(None, 42, "224.0.0.1".parse().unwrap(), Direction::Out, "00ff");
        assert!(res.is_err());
    }
}
