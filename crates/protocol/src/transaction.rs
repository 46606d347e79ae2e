//! Legacy transaction format
//!
//! A transaction is a list of signatures followed by the message they sign.
//! The message carries a 3-byte header, the deduplicated account keys, the
//! recent block hash and the instructions compiled to key indices.

use crate::address::{Address, Hash, Signature};
use crate::instruction::{AccountMeta, Instruction};
use crate::keypair::{verify_signature, Keypair};
use weightlink_common::{Result, WeightLinkError};

/// Largest serialized transaction the ledger accepts
pub const PACKET_DATA_SIZE: usize = 1232;

/// Append `value` in the compact-u16 encoding (7 bits per byte)
pub fn encode_compact_u16(out: &mut Vec<u8>, value: u16) {
    let mut rem = value;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            out.push(byte);
            break;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

/// Read a compact-u16 from the front of `bytes`, returning value and width
pub fn decode_compact_u16(bytes: &[u8]) -> Result<(u16, usize)> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().take(3).enumerate() {
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return u16::try_from(value)
                .map(|v| (v, i + 1))
                .map_err(|_| WeightLinkError::protocol("compact-u16 overflow"));
        }
    }
    Err(WeightLinkError::protocol("truncated compact-u16"))
}

fn compact_len(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| WeightLinkError::invalid_input(format!("too many {}: {}", what, len)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub num_required_signatures: u8,
    pub num_readonly_signed_accounts: u8,
    pub num_readonly_unsigned_accounts: u8,
}

/// An instruction with its program and accounts replaced by key indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub account_keys: Vec<Address>,
    pub recent_blockhash: Hash,
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Clone, Copy)]
struct KeyFlags {
    is_signer: bool,
    is_writable: bool,
}

impl Message {
    /// Compile instructions for `payer`, who signs first and pays fees
    pub fn compile(instructions: &[Instruction], payer: &Address, recent_blockhash: Hash) -> Result<Self> {
        // First-seen order with merged flags; the payer leads.
        let mut keys: Vec<(Address, KeyFlags)> = vec![(
            *payer,
            KeyFlags {
                is_signer: true,
                is_writable: true,
            },
        )];
        let mut merge = |meta: AccountMeta| match keys.iter_mut().find(|(key, _)| *key == meta.pubkey) {
            Some((_, flags)) => {
                flags.is_signer |= meta.is_signer;
                flags.is_writable |= meta.is_writable;
            }
            None => keys.push((
                meta.pubkey,
                KeyFlags {
                    is_signer: meta.is_signer,
                    is_writable: meta.is_writable,
                },
            )),
        };
        for ix in instructions {
            for meta in &ix.accounts {
                merge(*meta);
            }
            merge(AccountMeta::readonly(ix.program_id, false));
        }

        // Stable sort keeps the payer first among writable signers.
        keys.sort_by_key(|(_, flags)| match (flags.is_signer, flags.is_writable) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        });

        let count = |signer: bool, writable: bool| {
            keys.iter()
                .filter(|(_, f)| f.is_signer == signer && f.is_writable == writable)
                .count()
        };
        let as_u8 = |n: usize| {
            u8::try_from(n).map_err(|_| WeightLinkError::invalid_input(format!("too many accounts: {}", n)))
        };
        let header = MessageHeader {
            num_required_signatures: as_u8(count(true, true) + count(true, false))?,
            num_readonly_signed_accounts: as_u8(count(true, false))?,
            num_readonly_unsigned_accounts: as_u8(count(false, false))?,
        };
        let account_keys: Vec<Address> = keys.into_iter().map(|(key, _)| key).collect();
        as_u8(account_keys.len())?;

        let index_of = |key: &Address| -> Result<u8> {
            account_keys
                .iter()
                .position(|k| k == key)
                .map(|i| i as u8)
                .ok_or_else(|| WeightLinkError::internal(format!("account {} missing from message", key)))
        };
        let compiled = instructions
            .iter()
            .map(|ix| {
                Ok(CompiledInstruction {
                    program_id_index: index_of(&ix.program_id)?,
                    accounts: ix
                        .accounts
                        .iter()
                        .map(|meta| index_of(&meta.pubkey))
                        .collect::<Result<Vec<_>>>()?,
                    data: ix.data.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            header,
            account_keys,
            recent_blockhash,
            instructions: compiled,
        })
    }

    /// Keys that must sign, in signature order
    pub fn signer_keys(&self) -> &[Address] {
        &self.account_keys[..self.header.num_required_signatures as usize]
    }

    pub fn is_writable(&self, index: usize) -> bool {
        let signers = self.header.num_required_signatures as usize;
        let keys = self.account_keys.len();
        if index < signers {
            index < signers - self.header.num_readonly_signed_accounts as usize
        } else {
            index < keys - self.header.num_readonly_unsigned_accounts as usize
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(256);
        out.push(self.header.num_required_signatures);
        out.push(self.header.num_readonly_signed_accounts);
        out.push(self.header.num_readonly_unsigned_accounts);

        encode_compact_u16(&mut out, compact_len(self.account_keys.len(), "account keys")?);
        for key in &self.account_keys {
            out.extend_from_slice(key.as_slice());
        }
        out.extend_from_slice(self.recent_blockhash.as_slice());

        encode_compact_u16(&mut out, compact_len(self.instructions.len(), "instructions")?);
        for ix in &self.instructions {
            out.push(ix.program_id_index);
            encode_compact_u16(&mut out, compact_len(ix.accounts.len(), "instruction accounts")?);
            out.extend_from_slice(&ix.accounts);
            encode_compact_u16(&mut out, compact_len(ix.data.len(), "instruction data bytes")?);
            out.extend_from_slice(&ix.data);
        }
        Ok(out)
    }

    /// Parse a serialized message
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader { bytes, pos: 0 };
        let header = MessageHeader {
            num_required_signatures: reader.u8()?,
            num_readonly_signed_accounts: reader.u8()?,
            num_readonly_unsigned_accounts: reader.u8()?,
        };
        let key_count = reader.compact()?;
        let mut account_keys = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            account_keys.push(Address::try_from_slice(reader.take(32)?)?);
        }
        let recent_blockhash = Hash::try_from_slice(reader.take(32)?)?;

        let ix_count = reader.compact()?;
        let mut instructions = Vec::with_capacity(ix_count as usize);
        for _ in 0..ix_count {
            let program_id_index = reader.u8()?;
            let n = reader.compact()? as usize;
            let accounts = reader.take(n)?.to_vec();
            let n = reader.compact()? as usize;
            let data = reader.take(n)?.to_vec();
            instructions.push(CompiledInstruction {
                program_id_index,
                accounts,
                data,
            });
        }

        let message = Self {
            header,
            account_keys,
            recent_blockhash,
            instructions,
        };
        if (message.header.num_required_signatures as usize) > message.account_keys.len() {
            return Err(WeightLinkError::protocol("more signers than account keys"));
        }
        let key_count = message.account_keys.len();
        let out_of_range = message.instructions.iter().any(|ix| {
            ix.program_id_index as usize >= key_count || ix.accounts.iter().any(|&a| a as usize >= key_count)
        });
        if out_of_range {
            return Err(WeightLinkError::protocol("instruction references unknown account"));
        }
        Ok(message)
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| WeightLinkError::protocol("transaction truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn compact(&mut self) -> Result<u16> {
        let (value, width) = decode_compact_u16(&self.bytes[self.pos.min(self.bytes.len())..])?;
        self.pos += width;
        Ok(value)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

/// A signed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub signatures: Vec<Signature>,
    pub message: Message,
}

impl Transaction {
    /// Compile and sign. `signers` must cover every signer the
    /// instructions require, payer included; extra keypairs are ignored.
    pub fn sign(
        instructions: &[Instruction],
        payer: &Keypair,
        signers: &[&Keypair],
        recent_blockhash: Hash,
    ) -> Result<Self> {
        let message = Message::compile(instructions, &payer.pubkey(), recent_blockhash)?;
        let bytes = message.serialize()?;

        let signatures = message
            .signer_keys()
            .iter()
            .map(|key| {
                std::iter::once(payer)
                    .chain(signers.iter().copied())
                    .find(|kp| kp.pubkey() == *key)
                    .map(|kp| kp.sign(&bytes))
                    .ok_or_else(|| WeightLinkError::keypair(format!("missing signer for {}", key)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { signatures, message })
    }

    /// Transaction id: the fee payer's signature
    pub fn signature(&self) -> Option<&Signature> {
        self.signatures.first()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let message = self.message.serialize()?;
        let mut out = Vec::with_capacity(3 + self.signatures.len() * Signature::LEN + message.len());
        encode_compact_u16(&mut out, compact_len(self.signatures.len(), "signatures")?);
        for sig in &self.signatures {
            out.extend_from_slice(sig.as_slice());
        }
        out.extend_from_slice(&message);
        Ok(out)
    }

    /// Serialize and enforce the packet size limit
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let bytes = self.serialize()?;
        if bytes.len() > PACKET_DATA_SIZE {
            return Err(WeightLinkError::invalid_input(format!(
                "transaction is {} bytes, limit is {}",
                bytes.len(),
                PACKET_DATA_SIZE
            )));
        }
        Ok(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader { bytes, pos: 0 };
        let count = reader.compact()?;
        let mut signatures = Vec::with_capacity(count as usize);
        for _ in 0..count {
            signatures.push(Signature::try_from_slice(reader.take(Signature::LEN)?)?);
        }
        let message = Message::deserialize(reader.rest())?;
        if signatures.len() != message.header.num_required_signatures as usize {
            return Err(WeightLinkError::protocol(format!(
                "expected {} signatures, found {}",
                message.header.num_required_signatures,
                signatures.len()
            )));
        }
        Ok(Self { signatures, message })
    }

    /// Check every signature against its signer key
    pub fn verify(&self) -> Result<()> {
        let bytes = self.message.serialize()?;
        let signers = self.message.signer_keys();
        if signers.len() != self.signatures.len() {
            return Err(WeightLinkError::protocol("signature count mismatch"));
        }
        for (key, sig) in signers.iter().zip(&self.signatures) {
            if !verify_signature(key, &bytes, sig) {
                return Err(WeightLinkError::protocol(format!("invalid signature for {}", key)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{set_compute_unit_limit, ProgramInstructions};

    fn program() -> ProgramInstructions {
        ProgramInstructions::new("CG3rq4URcAwEUNnfGZ3YHRKTZAZgyemttN1BQwypa8qj".parse().unwrap())
    }

    #[test]
    fn test_compact_u16() {
        for (value, expected) in [
            (0u16, vec![0x00]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x80, 0x01]),
            (0x3fff, vec![0xff, 0x7f]),
            (0xffff, vec![0xff, 0xff, 0x03]),
        ] {
            let mut out = Vec::new();
            encode_compact_u16(&mut out, value);
            assert_eq!(out, expected);
            assert_eq!(decode_compact_u16(&out).unwrap(), (value, expected.len()));
        }
        assert!(decode_compact_u16(&[0x80]).is_err());
    }

    #[test]
    fn test_account_ordering_and_header() {
        let payer = Keypair::from_seed([1u8; 32]);
        let registry = Keypair::from_seed([2u8; 32]);
        let shape = crate::accounts::ModelShape {
            vocab_size: 256,
            embedding_dim: 128,
            hidden_dim: 128,
            context_length: 128,
            layer_count: 1,
        };
        let ixs = vec![
            set_compute_unit_limit(1_400_000),
            program().initialize_model(&payer.pubkey(), &registry.pubkey(), &shape),
        ];
        let message = Message::compile(&ixs, &payer.pubkey(), Hash::default()).unwrap();

        assert_eq!(message.account_keys[0], payer.pubkey());
        assert_eq!(message.account_keys[1], registry.pubkey());
        assert_eq!(message.header.num_required_signatures, 2);
        assert_eq!(message.header.num_readonly_signed_accounts, 0);
        // compute budget, model program, system program
        assert_eq!(message.header.num_readonly_unsigned_accounts, 3);
        assert!(message.is_writable(1));
        assert!(!message.is_writable(2));
    }

    #[test]
    fn test_sign_verify_and_parse() {
        let payer = Keypair::from_seed([1u8; 32]);
        let chunk = Keypair::from_seed([3u8; 32]);
        let registry = Address::new([9u8; 32]);
        let ix = program().upload_chunk(&payer.pubkey(), &registry, &chunk.pubkey(), 0, 0, &[1, 2, 3]);

        let tx = Transaction::sign(&[ix], &payer, &[&chunk], Hash::new([7u8; 32])).unwrap();
        assert_eq!(tx.signatures.len(), 2);
        tx.verify().unwrap();

        let parsed = Transaction::deserialize(&tx.to_wire().unwrap()).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.signature(), tx.signature());
    }

    #[test]
    fn test_missing_signer_rejected() {
        let payer = Keypair::from_seed([1u8; 32]);
        let chunk = Keypair::from_seed([3u8; 32]);
        let ix = program().upload_chunk(&payer.pubkey(), &Address::new([9u8; 32]), &chunk.pubkey(), 0, 0, &[]);

        assert!(Transaction::sign(&[ix], &payer, &[], Hash::default()).is_err());
    }

    #[test]
    fn test_tampered_message_fails_verification() {
        let payer = Keypair::from_seed([1u8; 32]);
        let ix = program().close_given_account(&payer.pubkey(), &Address::new([4u8; 32]));
        let mut tx = Transaction::sign(&[ix], &payer, &[], Hash::default()).unwrap();
        tx.message.recent_blockhash = Hash::new([1u8; 32]);
        assert!(tx.verify().is_err());
    }

    #[test]
    fn test_oversized_transaction_rejected() {
        let payer = Keypair::from_seed([1u8; 32]);
        let chunk = Keypair::from_seed([3u8; 32]);
        let values = vec![0i32; 400];
        let ix = program().upload_chunk(&payer.pubkey(), &Address::new([9u8; 32]), &chunk.pubkey(), 0, 0, &values);
        let tx = Transaction::sign(&[ix], &payer, &[&chunk], Hash::default()).unwrap();

        let err = tx.to_wire().unwrap_err();
        assert!(matches!(err, WeightLinkError::InvalidInput(_)));
    }
}
