//! In-process ledger
//!
//! Executes the model program's state transitions against an in-memory
//! account map. Used by `--dry-run` and by tests, with knobs to inject the
//! failures a real node produces: dropped sends and confirmations that
//! show up late.

use crate::ledger::{AccountData, LedgerClient, SignatureStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use weightlink_common::config::{MAX_CHUNK_LEN, MAX_SEQ_LEN};
use weightlink_common::{Result, WeightLinkError};
use weightlink_protocol::instruction::decode_compute_unit_limit;
use weightlink_protocol::{
    Address, AddressDeriver, ChatState, Hash, ModelChunk, ModelRegistry, ProgramCall, Signature, Transaction,
};

const PREFLIGHT_FAILURE: i64 = -32002;
const SIGNATURE_FAILURE: i64 = -32003;

/// `ConstraintSeeds`
const ERROR_SEEDS: u32 = 2006;
/// `AccountDiscriminatorMismatch` / missing account
const ERROR_ACCOUNT: u32 = 3001;
/// Signer is not the record's authority
const ERROR_AUTHORITY: u32 = 6000;
/// Chat input longer than the sequence limit
const ERROR_INPUT_LENGTH: u32 = 6001;
/// Chunk payload over capacity
const ERROR_CHUNK_LENGTH: u32 = 6002;

/// Storage balance credited to every created record
const RECORD_LAMPORTS: u64 = 1_000_000;

/// Produces the response text for a chat input, `None` for no response
pub type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One executed chunk upload, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadEvent {
    pub chunk_type: u8,
    pub chunk_index: u32,
    pub chunk: Address,
}

struct LandedTransaction {
    logs: Vec<String>,
    hidden_polls: u32,
}

#[derive(Default)]
struct LedgerState {
    blockhash_seq: u64,
    issued_blockhashes: HashSet<Hash>,
    accounts: HashMap<Address, AccountData>,
    transactions: HashMap<Signature, LandedTransaction>,
    uploads: Vec<UploadEvent>,
    fail_sends: u32,
    hide_next_confirmation: u32,
    sends: u64,
    chat_inits: u64,
}

/// Failure of one instruction
struct ProgramFailure {
    code: u32,
    message: String,
}

fn program_error(code: u32, message: impl Into<String>) -> ProgramFailure {
    ProgramFailure {
        code,
        message: message.into(),
    }
}

fn load_registry(
    accounts: &HashMap<Address, AccountData>,
    address: &Address,
) -> std::result::Result<ModelRegistry, ProgramFailure> {
    accounts
        .get(address)
        .and_then(|a| ModelRegistry::decode(&a.data).ok())
        .ok_or_else(|| program_error(ERROR_ACCOUNT, format!("{} is not a model registry", address)))
}

/// An in-memory ledger running the model program
pub struct SimulatedLedger {
    program_id: Address,
    deriver: AddressDeriver,
    state: Mutex<LedgerState>,
    responder: Responder,
}

impl SimulatedLedger {
    pub fn new(program_id: Address) -> Self {
        Self {
            program_id,
            deriver: AddressDeriver::new(program_id),
            state: Mutex::new(LedgerState::default()),
            responder: Box::new(|input| Some(format!("You said: {}", input))),
        }
    }

    /// Replace the chat responder
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    /// The next `count` sends fail with a connection error and are not applied
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().fail_sends = count;
    }

    /// The next landed transaction reports no status for `polls` status queries
    pub fn hide_next_confirmation(&self, polls: u32) {
        self.state.lock().hide_next_confirmation = polls;
    }

    /// Transactions accepted (applied) so far
    pub fn send_count(&self) -> u64 {
        self.state.lock().sends
    }

    /// `initialize_chat` instructions executed so far
    pub fn chat_init_count(&self) -> u64 {
        self.state.lock().chat_inits
    }

    /// Chunk uploads in execution order
    pub fn uploads(&self) -> Vec<UploadEvent> {
        self.state.lock().uploads.clone()
    }

    /// Decoded registry at `address`
    pub fn registry(&self, address: &Address) -> Option<ModelRegistry> {
        let state = self.state.lock();
        state
            .accounts
            .get(address)
            .and_then(|account| ModelRegistry::decode(&account.data).ok())
    }

    /// Create a record directly, bypassing the program
    pub fn insert_account(&self, address: Address, data: Vec<u8>) {
        self.state.lock().accounts.insert(
            address,
            AccountData {
                owner: self.program_id,
                lamports: RECORD_LAMPORTS,
                data,
            },
        );
    }

    fn create_record(
        &self,
        accounts: &mut HashMap<Address, AccountData>,
        address: Address,
        data: Vec<u8>,
    ) -> std::result::Result<(), ProgramFailure> {
        if accounts.contains_key(&address) {
            return Err(program_error(0, format!("Allocate: account {} already in use", address)));
        }
        accounts.insert(
            address,
            AccountData {
                owner: self.program_id,
                lamports: RECORD_LAMPORTS,
                data,
            },
        );
        Ok(())
    }

    fn execute(
        &self,
        tx: &Transaction,
        accounts: &mut HashMap<Address, AccountData>,
        uploads: &mut Vec<UploadEvent>,
        chat_inits: &mut u64,
        logs: &mut Vec<String>,
    ) -> std::result::Result<(), ProgramFailure> {
        let message = &tx.message;
        let signer_count = message.header.num_required_signatures as usize;

        for ix in &message.instructions {
            let program = message.account_keys[ix.program_id_index as usize];
            let metas: Vec<(Address, bool, bool)> = ix
                .accounts
                .iter()
                .map(|&i| {
                    let i = i as usize;
                    (message.account_keys[i], i < signer_count, message.is_writable(i))
                })
                .collect();

            if program == Address::COMPUTE_BUDGET_PROGRAM {
                let units = decode_compute_unit_limit(&ix.data)
                    .ok_or_else(|| program_error(0, "invalid compute budget instruction"))?;
                logs.push(format!("Program {} invoke [1]", program));
                logs.push(format!("Program {} success", program));
                debug!(units, "Compute unit limit set");
                continue;
            }
            if program != self.program_id {
                return Err(program_error(0, format!("unknown program {}", program)));
            }

            let call = ProgramCall::decode(&ix.data).map_err(|e| program_error(101, e.to_string()))?;
            logs.push(format!("Program {} invoke [1]", program));
            logs.push(format!("Program log: Instruction: {}", call.name()));
            self.apply(call, &metas, accounts, uploads, chat_inits, logs)?;
            logs.push(format!("Program {} success", program));
        }
        Ok(())
    }

    fn apply(
        &self,
        call: ProgramCall,
        metas: &[(Address, bool, bool)],
        accounts: &mut HashMap<Address, AccountData>,
        uploads: &mut Vec<UploadEvent>,
        chat_inits: &mut u64,
        logs: &mut Vec<String>,
    ) -> std::result::Result<(), ProgramFailure> {
        let account = |i: usize, signer: bool, writable: bool| -> std::result::Result<Address, ProgramFailure> {
            let (key, is_signer, is_writable) = metas
                .get(i)
                .copied()
                .ok_or_else(|| program_error(3005, "not enough account keys"))?;
            if signer && !is_signer {
                return Err(program_error(3010, format!("{} must sign", key)));
            }
            if writable && !is_writable {
                return Err(program_error(2000, format!("{} must be writable", key)));
            }
            Ok(key)
        };
        match call {
            ProgramCall::InitializeModel(shape) => {
                let signer = account(0, true, true)?;
                let registry = account(1, true, true)?;
                let record = ModelRegistry {
                    authority: signer,
                    chunk_count: 0,
                    shape,
                };
                self.create_record(accounts, registry, record.encode())?;
            }
            ProgramCall::UploadChunk {
                chunk_index,
                chunk_type,
                data,
            } => {
                let signer = account(0, true, true)?;
                let registry_address = account(1, false, true)?;
                let chunk = account(2, true, true)?;

                let mut registry = load_registry(accounts, &registry_address)?;
                if registry.authority != signer {
                    return Err(program_error(ERROR_AUTHORITY, "signer is not the registry authority"));
                }
                if data.len() > MAX_CHUNK_LEN {
                    return Err(program_error(
                        ERROR_CHUNK_LENGTH,
                        format!("chunk of {} values exceeds {}", data.len(), MAX_CHUNK_LEN),
                    ));
                }
                let record = ModelChunk {
                    authority: signer,
                    registry: registry_address,
                    chunk_index,
                    chunk_type,
                    data,
                };
                self.create_record(accounts, chunk, record.encode())?;

                registry.chunk_count += 1;
                if let Some(stored) = accounts.get_mut(&registry_address) {
                    stored.data = registry.encode();
                }
                uploads.push(UploadEvent {
                    chunk_type,
                    chunk_index,
                    chunk,
                });
            }
            ProgramCall::InitializeChat => {
                let signer = account(0, true, true)?;
                let session = account(1, false, true)?;
                let model = account(2, false, false)?;

                let expected = self
                    .deriver
                    .session("chat", &signer)
                    .map_err(|e| program_error(ERROR_SEEDS, e.to_string()))?;
                if expected.address != session {
                    return Err(program_error(ERROR_SEEDS, "session address does not match seeds"));
                }
                load_registry(accounts, &model)?;
                let record = ChatState {
                    authority: signer,
                    model,
                    history: vec![0u8; MAX_SEQ_LEN],
                    history_len: 0,
                };
                self.create_record(accounts, session, record.encode())?;
                *chat_inits += 1;
            }
            ProgramCall::Chat {
                input_text,
                input_length,
            } => {
                let signer = account(0, true, true)?;
                let session = account(1, false, true)?;
                let registry = account(2, false, false)?;

                let mut state = accounts
                    .get(&session)
                    .and_then(|a| ChatState::decode(&a.data).ok())
                    .ok_or_else(|| program_error(ERROR_ACCOUNT, format!("{} is not a chat state", session)))?;
                if state.authority != signer {
                    return Err(program_error(ERROR_AUTHORITY, "signer is not the session authority"));
                }
                if input_length as usize > MAX_SEQ_LEN {
                    return Err(program_error(ERROR_INPUT_LENGTH, "input longer than sequence limit"));
                }
                load_registry(accounts, &registry)?;

                let end = (input_length as usize).min(input_text.len());
                let text = String::from_utf8_lossy(&input_text[..end]).into_owned();
                state.history = input_text;
                state.history_len = input_length;
                if let Some(stored) = accounts.get_mut(&session) {
                    stored.data = state.encode();
                }

                if let Some(response) = (self.responder)(&text) {
                    logs.push(format!(
                        "Program log: LLM RESPONSE: {}",
                        utf8_percent_encode(&response, NON_ALPHANUMERIC)
                    ));
                }
            }
            ProgramCall::CloseGivenAccount => {
                account(0, true, true)?;
                let target = account(1, false, true)?;
                if accounts.remove(&target).is_none() {
                    return Err(program_error(ERROR_ACCOUNT, format!("{} does not exist", target)));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn latest_blockhash(&self) -> Result<Hash> {
        let mut state = self.state.lock();
        state.blockhash_seq += 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&state.blockhash_seq.to_le_bytes());
        let hash = Hash::new(bytes);
        state.issued_blockhashes.insert(hash);
        Ok(hash)
    }

    async fn send_transaction(&self, wire: &[u8]) -> Result<Signature> {
        let tx = Transaction::deserialize(wire)?;
        let signature = *tx
            .signature()
            .ok_or_else(|| WeightLinkError::invalid_input("transaction carries no signature"))?;

        let mut state = self.state.lock();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(WeightLinkError::connection("simulated send failure"));
        }
        if tx.verify().is_err() {
            return Err(WeightLinkError::Rpc {
                code: SIGNATURE_FAILURE,
                message: "Transaction signature verification failure".to_string(),
                logs: vec![],
            });
        }
        if !state.issued_blockhashes.contains(&tx.message.recent_blockhash) {
            return Err(WeightLinkError::Rpc {
                code: PREFLIGHT_FAILURE,
                message: "Transaction simulation failed: Blockhash not found".to_string(),
                logs: vec![],
            });
        }
        if state.transactions.contains_key(&signature) {
            return Ok(signature);
        }

        // Apply against a copy so a failing instruction leaves no trace.
        let mut accounts = state.accounts.clone();
        let mut uploads = Vec::new();
        let mut chat_inits = 0;
        let mut logs = Vec::new();
        if let Err(failure) = self.execute(&tx, &mut accounts, &mut uploads, &mut chat_inits, &mut logs) {
            logs.push(format!("Program log: {}", failure.message));
            logs.push(format!(
                "Program {} failed: custom program error: {:#x}",
                self.program_id, failure.code
            ));
            return Err(WeightLinkError::Rpc {
                code: PREFLIGHT_FAILURE,
                message: format!(
                    "Transaction simulation failed: Error processing Instruction 0: custom program error: {:#x}",
                    failure.code
                ),
                logs,
            });
        }

        state.accounts = accounts;
        state.uploads.extend(uploads);
        state.chat_inits += chat_inits;
        state.sends += 1;
        let hidden_polls = std::mem::take(&mut state.hide_next_confirmation);
        state
            .transactions
            .insert(signature, LandedTransaction { logs, hidden_polls });
        Ok(signature)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<SignatureStatus>> {
        let mut state = self.state.lock();
        let Some(landed) = state.transactions.get_mut(signature) else {
            return Ok(None);
        };
        if landed.hidden_polls > 0 {
            landed.hidden_polls -= 1;
            return Ok(None);
        }
        Ok(Some(SignatureStatus::Confirmed))
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .get(signature)
            .filter(|landed| landed.hidden_polls == 0)
            .map(|landed| landed.logs.clone()))
    }

    async fn get_account(&self, address: &Address) -> Result<Option<AccountData>> {
        Ok(self.state.lock().accounts.get(address).cloned())
    }
}
