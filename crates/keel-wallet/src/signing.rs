//! Input signing for 2-of-3 P2SH multisig.
//!
//! A [`Signer`] produces one ECDSA signature over one input digest. The
//! [`SigningEngine`] runs its signers input by input, matches each signature
//! to its redeem-script key, and finalizes the `script_sig` once two
//! signatures are present. Signatures are always placed in redeem-script key
//! order, as `OP_CHECKMULTISIG` requires.

use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, VerifyOnly};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Script, ScriptBuf, Transaction};
use tracing::debug;

use keel_core::constants::REQUIRED_SIGNATURES;
use keel_core::path::WalletPath;
use keel_core::script::multisig_keys;
use keel_core::traits::WalletService;
use keel_core::types::CosignRequest;

use crate::builder::UnsignedTransaction;
use crate::error::WalletError;
use crate::keys::{KeyRole, MasterKey};

/// One input digest to sign.
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    pub input_index: usize,
    pub path: &'a WalletPath,
    /// Legacy SIGHASH_ALL digest of the input.
    pub sighash: [u8; 32],
    pub redeem_script: &'a Script,
}

/// A signature contributed by one signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialSignature {
    pub signer: &'static str,
    pub signature: ecdsa::Signature,
}

/// Signing capability: local key or remote cosigner.
pub trait Signer {
    fn name(&self) -> &'static str;

    fn sign(&self, request: &SigningRequest<'_>) -> Result<PartialSignature, WalletError>;
}

/// Signs with a locally held master key (primary or backup).
pub struct LocalSigner<'a> {
    key: &'a MasterKey,
    secp: Secp256k1<All>,
}

impl<'a> LocalSigner<'a> {
    pub fn new(key: &'a MasterKey) -> Self {
        Self { key, secp: Secp256k1::new() }
    }
}

impl Signer for LocalSigner<'_> {
    fn name(&self) -> &'static str {
        match self.key.role() {
            KeyRole::Primary => "primary",
            KeyRole::Backup => "backup",
        }
    }

    fn sign(&self, request: &SigningRequest<'_>) -> Result<PartialSignature, WalletError> {
        let secret = self.key.signing_key(&self.secp, request.path)?;
        let msg = Message::from_digest(request.sighash);
        let signature = self.secp.sign_ecdsa(&msg, &secret);
        Ok(PartialSignature {
            signer: self.name(),
            signature: ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All },
        })
    }
}

/// Obtains the cosigner's signature from the wallet service.
pub struct RemoteCosigner<'a> {
    service: &'a dyn WalletService,
    identifier: &'a str,
}

impl<'a> RemoteCosigner<'a> {
    pub fn new(service: &'a dyn WalletService, identifier: &'a str) -> Self {
        Self { service, identifier }
    }
}

impl Signer for RemoteCosigner<'_> {
    fn name(&self) -> &'static str {
        "cosigner"
    }

    fn sign(&self, request: &SigningRequest<'_>) -> Result<PartialSignature, WalletError> {
        let cosign = CosignRequest { path: request.path.to_string(), sighash: hex::encode(request.sighash) };
        let response = self.service.cosign(self.identifier, &cosign)?;
        let bytes = hex::decode(response.trim())
            .map_err(|e| WalletError::Signing(format!("cosigner signature is not hex: {e}")))?;
        let signature = ecdsa::Signature::from_slice(&bytes)
            .map_err(|e| WalletError::Signing(format!("cosigner signature: {e}")))?;
        Ok(PartialSignature { signer: self.name(), signature })
    }
}

/// Result of [`SigningEngine::sign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: Transaction,
    /// Fewest signatures collected on any input.
    pub signatures: usize,
    /// Every input carries a finalized 2-of-3 script_sig.
    pub complete: bool,
}

/// Applies signers to every input of an unsigned transaction.
pub struct SigningEngine<'a> {
    signers: Vec<&'a dyn Signer>,
    secp: Secp256k1<VerifyOnly>,
}

impl Default for SigningEngine<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> SigningEngine<'a> {
    pub fn new() -> Self {
        Self { signers: Vec::new(), secp: Secp256k1::verification_only() }
    }

    /// Add a signer. Signers run in insertion order; once an input has two
    /// signatures the remaining signers are skipped for it.
    pub fn with_signer(mut self, signer: &'a dyn Signer) -> Self {
        self.signers.push(signer);
        self
    }

    pub fn sign(&self, unsigned: &UnsignedTransaction) -> Result<SignedTransaction, WalletError> {
        if unsigned.inputs.len() != unsigned.tx.input.len() {
            return Err(WalletError::Signing("input metadata does not match transaction".into()));
        }

        let cache = SighashCache::new(&unsigned.tx);
        let mut script_sigs = Vec::with_capacity(unsigned.inputs.len());
        let mut fewest = usize::MAX;

        for (index, input) in unsigned.inputs.iter().enumerate() {
            let path: WalletPath = input.path.parse()?;
            let digest = cache
                .legacy_signature_hash(index, &input.redeem_script, EcdsaSighashType::All.to_u32())
                .map_err(|e| WalletError::Signing(e.to_string()))?
                .to_byte_array();
            let msg = Message::from_digest(digest);
            let keys = multisig_keys(&input.redeem_script)?;

            let mut slots: Vec<Option<ecdsa::Signature>> = vec![None; keys.len()];
            for signer in &self.signers {
                if slots.iter().flatten().count() >= REQUIRED_SIGNATURES {
                    break;
                }
                let request = SigningRequest {
                    input_index: index,
                    path: &path,
                    sighash: digest,
                    redeem_script: &input.redeem_script,
                };
                let partial = signer.sign(&request)?;
                let position = keys
                    .iter()
                    .position(|key| self.secp.verify_ecdsa(&msg, &partial.signature.signature, &key.inner).is_ok())
                    .ok_or_else(|| {
                        WalletError::Signing(format!("{} signature on input {index} matches no wallet key", partial.signer))
                    })?;
                slots[position] = Some(partial.signature);
            }

            let signatures: Vec<ecdsa::Signature> = slots.into_iter().flatten().collect();
            fewest = fewest.min(signatures.len());
            debug!(input = index, signatures = signatures.len(), "input signed");
            script_sigs.push(if signatures.len() >= REQUIRED_SIGNATURES {
                Some(multisig_script_sig(&signatures, &input.redeem_script)?)
            } else {
                None
            });
        }

        let mut tx = unsigned.tx.clone();
        for (txin, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            if let Some(script_sig) = script_sig {
                txin.script_sig = script_sig;
            }
        }
        let signatures = if unsigned.inputs.is_empty() { 0 } else { fewest };
        Ok(SignedTransaction { tx, signatures, complete: signatures >= REQUIRED_SIGNATURES })
    }
}

/// `OP_0 <sig> <sig> <redeem_script>`.
fn multisig_script_sig(signatures: &[ecdsa::Signature], redeem_script: &Script) -> Result<ScriptBuf, WalletError> {
    let push = |bytes: Vec<u8>| {
        PushBytesBuf::try_from(bytes).map_err(|e| WalletError::Signing(format!("push too large: {e}")))
    };
    let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
    for signature in signatures.iter().take(REQUIRED_SIGNATURES) {
        builder = builder.push_slice(push(signature.to_vec())?);
    }
    Ok(builder.push_slice(push(redeem_script.to_bytes())?).into_script())
}
