//! CLI commands for offline inspection
//!
//! Each command renders its report to a string so it can be checked in
//! tests; the `cmd_*` wrappers print it.

use std::fmt::Write as _;
use std::path::Path;

use rust_decimal::Decimal;

use crate::config::ChainConfig;
use crate::core::address::{address_for_script, hash_to_address, Address};
use crate::core::amount::from_base_units;
use crate::core::fee::{estimate_fee, estimate_size, FeeRate};
use crate::core::script::{classify, decode_ops, script_from_hex, ScriptOp, ScriptType};
use crate::core::transaction::RawTransaction;
use crate::multisig::{MultisigKind, RedeemScript};
use crate::storage::{JsonFileStore, ScanStore};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Render a raw transaction with per-output script types and addresses
pub fn render_decode(config: &ChainConfig, tx_hex: &str) -> CliResult<String> {
    let tx = RawTransaction::from_hex(tx_hex.trim())?;
    let decimals = config.wallet.decimals;
    let mut out = String::new();

    writeln!(out, "🧾 Transaction {}", tx.txid())?;
    if tx.has_witness() {
        writeln!(out, "   ├─ wtxid: {}", tx.wtxid())?;
    }
    writeln!(out, "   ├─ Version: {}", tx.version)?;
    writeln!(
        out,
        "   ├─ Size: {} bytes ({} vbytes, weight {})",
        tx.size(),
        tx.vsize(),
        tx.weight()
    )?;
    writeln!(out, "   ├─ Locktime: {}", tx.locktime)?;
    writeln!(out, "   ├─ RBF: {}", if tx.signals_rbf() { "yes" } else { "no" })?;

    writeln!(out, "   ├─ Inputs ({}):", tx.inputs.len())?;
    for (index, input) in tx.inputs.iter().enumerate() {
        if input.is_coinbase() {
            writeln!(out, "   │  └─ #{} coinbase", index)?;
        } else {
            writeln!(
                out,
                "   │  └─ #{} {}:{} seq {:#010x} ({} witness items)",
                index,
                input.txid,
                input.vout,
                input.sequence,
                tx.witness(index).len()
            )?;
        }
    }

    writeln!(out, "   └─ Outputs ({}):", tx.outputs.len())?;
    for (index, output) in tx.outputs.iter().enumerate() {
        let script_type = classify(&output.lock_script);
        let address = address_for_script(&output.lock_script, &config.address).unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "      └─ #{} {} {} {}",
            index,
            from_base_units(output.amount, decimals),
            script_type.type_name(),
            address
        )?;
    }
    write!(out, "   Total out: {} {}", from_base_units(tx.total_output(), decimals), config.symbol)?;
    Ok(out)
}

pub fn cmd_decode(config: &ChainConfig, tx_hex: &str) -> CliResult<()> {
    println!("{}", render_decode(config, tx_hex)?);
    Ok(())
}

/// Render a lock script's type, opcodes and address
pub fn render_classify(config: &ChainConfig, script_hex: &str) -> CliResult<String> {
    let script = script_from_hex(script_hex.trim())?;
    let script_type = classify(&script);
    let mut out = String::new();

    writeln!(out, "📜 Script type: {}", script_type.type_name())?;
    if let ScriptType::WitnessProgram { version } = script_type {
        writeln!(out, "   ├─ Witness version: {}", version)?;
    }
    writeln!(out, "   ├─ Spendable: {}", if script_type.is_spendable() { "yes" } else { "no" })?;
    if let Ok(ops) = decode_ops(&script) {
        let asm: Vec<String> = ops
            .iter()
            .map(|op| match op {
                ScriptOp::Push(data) if data.is_empty() => "OP_0".to_string(),
                ScriptOp::Push(data) => hex::encode(data),
                ScriptOp::Op(code) => format!("0x{:02x}", code),
            })
            .collect();
        writeln!(out, "   ├─ Ops: {}", asm.join(" "))?;
    }
    let address = address_for_script(&script, &config.address).unwrap_or_else(|| "-".to_string());
    write!(out, "   └─ Address: {}", address)?;
    Ok(out)
}

pub fn cmd_classify(config: &ChainConfig, script_hex: &str) -> CliResult<()> {
    println!("{}", render_classify(config, script_hex)?);
    Ok(())
}

/// Render what an address commits to
pub fn render_address_decode(config: &ChainConfig, address: &str) -> CliResult<String> {
    let decoded = Address::decode(address.trim(), &config.address)?;
    let mut out = String::new();
    writeln!(out, "📍 {}", address.trim())?;
    writeln!(out, "   ├─ Type: {}", decoded.script_type().type_name())?;
    writeln!(out, "   ├─ Payload: {}", hex::encode(decoded.payload()))?;
    write!(out, "   └─ Lock script: {}", hex::encode(decoded.lock_script()))?;
    Ok(out)
}

pub fn cmd_address_decode(config: &ChainConfig, address: &str) -> CliResult<()> {
    println!("{}", render_address_decode(config, address)?);
    Ok(())
}

/// Encode a hash as an address of the given kind (p2pkh, p2sh, p2wpkh, p2wsh)
pub fn render_address_encode(config: &ChainConfig, hash_hex: &str, kind: &str) -> CliResult<String> {
    let hash = hex::decode(hash_hex.trim())?;
    let script_type = match kind.to_ascii_lowercase().as_str() {
        "p2pkh" => ScriptType::P2PKH,
        "p2sh" => ScriptType::P2SH,
        "p2wpkh" => ScriptType::P2WPKH,
        "p2wsh" => ScriptType::P2WSH,
        other => return Err(format!("unknown address kind: {}", other).into()),
    };
    Ok(hash_to_address(&hash, script_type, &config.address)?)
}

pub fn cmd_address_encode(config: &ChainConfig, hash_hex: &str, kind: &str) -> CliResult<()> {
    println!("📍 {}", render_address_encode(config, hash_hex, kind)?);
    Ok(())
}

/// Build an M-of-N redeem script and its address
pub fn render_multisig(
    config: &ChainConfig,
    threshold: u8,
    pubkeys: &[String],
    kind: MultisigKind,
    sort_keys: bool,
) -> CliResult<String> {
    let redeem = if sort_keys {
        let keys = pubkeys
            .iter()
            .map(|k| hex::decode(k.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        RedeemScript::sorted(threshold, keys)?
    } else {
        RedeemScript::from_hex_keys(threshold, pubkeys)?
    };
    let address = redeem.address(kind).encode(&config.address)?;

    let mut out = String::new();
    writeln!(
        out,
        "🔐 {}-of-{} {:?} multisig",
        redeem.threshold(),
        redeem.signer_count(),
        kind
    )?;
    writeln!(out, "   ├─ Address: {}", address)?;
    write!(out, "   └─ Redeem script: {}", redeem.to_hex())?;
    Ok(out)
}

pub fn cmd_multisig(
    config: &ChainConfig,
    threshold: u8,
    pubkeys: &[String],
    kind: MultisigKind,
    sort_keys: bool,
) -> CliResult<()> {
    println!("{}", render_multisig(config, threshold, pubkeys, kind, sort_keys)?);
    Ok(())
}

/// Estimate size and fee for a transaction shape at a per-byte coin rate
pub fn render_fee(config: &ChainConfig, inputs: usize, outputs: usize, coin_per_byte: Decimal) -> CliResult<String> {
    let rate = FeeRate::from_coin_per_byte(coin_per_byte, config.wallet.decimals)?;
    let fee = estimate_fee(inputs, outputs, rate);
    Ok(format!(
        "💸 {} inputs, {} outputs: ~{} bytes, fee {} {} ({} units)",
        inputs,
        outputs,
        estimate_size(inputs, outputs),
        from_base_units(fee, config.wallet.decimals),
        config.symbol,
        fee
    ))
}

pub fn cmd_fee(config: &ChainConfig, inputs: usize, outputs: usize, coin_per_byte: Decimal) -> CliResult<()> {
    println!("{}", render_fee(config, inputs, outputs, coin_per_byte)?);
    Ok(())
}

/// Show the persisted scan cursor and retry queue
pub fn render_cursor(config: &ChainConfig, store_path: Option<&Path>) -> CliResult<String> {
    let path = store_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.store_path());
    if !path.exists() {
        return Ok(format!("📭 No scan store at {}", path.display()));
    }
    let store = JsonFileStore::open(&path, config.scanner.max_cached_headers)?;

    let mut out = String::new();
    writeln!(out, "🔎 Scan store {}", path.display())?;
    match store.cursor()? {
        Some(cursor) => writeln!(out, "   ├─ Cursor: height {} ({})", cursor.height, cursor.hash)?,
        None => writeln!(out, "   ├─ Cursor: none")?,
    }
    writeln!(out, "   ├─ Cached headers: {}", store.data().headers.len())?;

    let queued = store.unscanned()?;
    write!(out, "   └─ Retry queue: {}", queued.len())?;
    for record in queued.iter().take(20) {
        write!(
            out,
            "\n      └─ {} @ {} {:?} x{}: {} (last {})",
            record.txid,
            record.block_height,
            record.kind,
            record.attempts,
            record.reason,
            record.last_attempt.format("%Y-%m-%d %H:%M:%S")
        )?;
    }
    if queued.len() > 20 {
        write!(out, "\n      ... and {} more", queued.len() - 20)?;
    }
    Ok(out)
}

pub fn cmd_cursor(config: &ChainConfig, store_path: Option<&Path>) -> CliResult<()> {
    println!("{}", render_cursor(config, store_path)?);
    Ok(())
}
