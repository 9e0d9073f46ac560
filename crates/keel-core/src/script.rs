//! Script construction: 2-of-3 multisig redeem scripts, P2SH addresses
//! and OP_RETURN data outputs.
use std::str::FromStr;

use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Address, Network, PublicKey, Script, ScriptBuf};

use crate::constants::{MAX_STANDARD_OP_RETURN_SCRIPT_LEN, REQUIRED_SIGNATURES, TOTAL_KEYS};
use crate::error::ScriptError;

/// Sort keys lexicographically by their compressed encoding (BIP67).
pub fn sorted_keys(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by(|a, b| a.to_bytes().cmp(&b.to_bytes()));
    sorted
}

/// `OP_2 <k1> <k2> <k3> OP_3 OP_CHECKMULTISIG` over the sorted keys.
pub fn multisig_redeem_script(keys: &[PublicKey; TOTAL_KEYS]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(REQUIRED_SIGNATURES as i64);
    for key in sorted_keys(keys) {
        builder = builder.push_key(&key);
    }
    builder
        .push_int(TOTAL_KEYS as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Public keys of a multisig redeem script, in script order.
pub fn multisig_keys(redeem_script: &Script) -> Result<Vec<PublicKey>, ScriptError> {
    let mut keys = Vec::with_capacity(TOTAL_KEYS);
    for instruction in redeem_script.instructions() {
        let instruction =
            instruction.map_err(|e| ScriptError::MalformedRedeemScript(e.to_string()))?;
        if let Instruction::PushBytes(bytes) = instruction {
            if bytes.len() == 33 || bytes.len() == 65 {
                let key = PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|_| ScriptError::InvalidPublicKey)?;
                keys.push(key);
            }
        }
    }
    if keys.len() != TOTAL_KEYS {
        return Err(ScriptError::MalformedRedeemScript(format!(
            "expected {TOTAL_KEYS} keys, found {}",
            keys.len()
        )));
    }
    Ok(keys)
}

/// P2SH address paying to `redeem_script`.
pub fn p2sh_address(redeem_script: &Script, network: Network) -> Result<Address, ScriptError> {
    Address::p2sh(redeem_script, network).map_err(|e| ScriptError::InvalidAddress(e.to_string()))
}

/// Parse an address and require it to belong to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, ScriptError> {
    Address::from_str(address.trim())
        .map_err(|e| ScriptError::InvalidAddress(format!("{address}: {e}")))?
        .require_network(network)
        .map_err(|e| ScriptError::InvalidAddress(format!("{address}: {e}")))
}

/// OP_RETURN output script carrying `data`.
///
/// Scripts longer than the standard relay limit are rejected unless
/// `allow_non_standard` is set.
pub fn op_return_script(data: &[u8], allow_non_standard: bool) -> Result<ScriptBuf, ScriptError> {
    let push = PushBytesBuf::try_from(data.to_vec()).map_err(|_| ScriptError::PushTooLarge(data.len()))?;
    let script = ScriptBuf::new_op_return(&push);
    if script.len() > MAX_STANDARD_OP_RETURN_SCRIPT_LEN && !allow_non_standard {
        return Err(ScriptError::NonStandard {
            len: script.len(),
            max: MAX_STANDARD_OP_RETURN_SCRIPT_LEN,
        });
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn key(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn redeem_script_is_order_independent() {
        let (a, b, c) = (key(1), key(2), key(3));
        assert_eq!(multisig_redeem_script(&[a, b, c]), multisig_redeem_script(&[c, a, b]));
    }

    #[test]
    fn redeem_script_shape() {
        let script = multisig_redeem_script(&[key(1), key(2), key(3)]);
        // OP_2 + 3 * (1 + 33) + OP_3 + OP_CHECKMULTISIG
        assert_eq!(script.len(), 105);
        assert_eq!(script.as_bytes()[0], 0x52);
        assert_eq!(script.as_bytes()[104], 0xae);
    }

    #[test]
    fn keys_come_back_sorted() {
        let keys = [key(7), key(5), key(6)];
        let script = multisig_redeem_script(&keys);
        assert_eq!(multisig_keys(&script).unwrap(), sorted_keys(&keys));
    }

    #[test]
    fn multisig_keys_rejects_other_scripts() {
        let script = op_return_script(b"hello", false).unwrap();
        assert!(matches!(multisig_keys(&script), Err(ScriptError::MalformedRedeemScript(_))));
    }

    #[test]
    fn p2sh_address_round_trips_through_parse() {
        let script = multisig_redeem_script(&[key(1), key(2), key(3)]);
        let address = p2sh_address(&script, Network::Testnet).unwrap();
        let parsed = parse_address(&address.to_string(), Network::Testnet).unwrap();
        assert_eq!(parsed, address);
        assert!(parse_address(&address.to_string(), Network::Bitcoin).is_err());
    }

    #[test]
    fn op_return_within_standard_limit() {
        let script = op_return_script(&[0u8; 38], false).unwrap();
        assert_eq!(script.len(), 40);
        assert!(script.is_op_return());
    }

    #[test]
    fn op_return_over_limit_needs_override() {
        let data = [0u8; 39];
        assert_eq!(
            op_return_script(&data, false),
            Err(ScriptError::NonStandard { len: 41, max: 40 })
        );
        assert_eq!(op_return_script(&data, true).unwrap().len(), 41);
    }
}
