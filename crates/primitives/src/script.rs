//! Minimal script handling: integer pushes, push-only checks and the
//! standard output templates. Signature checking itself is delegated to
//! the validation layer's checker seam.

use crate::hash::hash160;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const MAX_SCRIPT_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    NullData,
    Nonstandard,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::PubKeyHash
    } else if is_p2sh(script) {
        ScriptType::ScriptHash
    } else if is_p2pk(script) {
        ScriptType::PubKey
    } else if script.first() == Some(&OP_RETURN) {
        ScriptType::NullData
    } else {
        ScriptType::Nonstandard
    }
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };
    script.len() == key_len as usize + 2 && script[script.len() - 1] == OP_CHECKSIG
}

/// Address-index key of an output script: (type, hash160). `None` for
/// scripts that do not pay to a recoverable address.
pub fn address_key(script: &[u8]) -> Option<(u8, [u8; 20])> {
    match classify_script_pubkey(script) {
        ScriptType::PubKeyHash => {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&script[3..23]);
            Some((1, hash))
        }
        ScriptType::ScriptHash => {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&script[2..22]);
            Some((2, hash))
        }
        ScriptType::PubKey => {
            let key_len = script[0] as usize;
            Some((1, hash160(&script[1..1 + key_len])))
        }
        _ => None,
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            OP_0 => {}
            0x01..=0x4b => {
                cursor += opcode as usize;
            }
            OP_PUSHDATA1 => {
                if cursor >= script.len() {
                    return false;
                }
                cursor += 1 + script[cursor] as usize;
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    return false;
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2 + len;
            }
            OP_PUSHDATA4 => {
                if cursor + 4 > script.len() {
                    return false;
                }
                let len = u32::from_le_bytes([
                    script[cursor],
                    script[cursor + 1],
                    script[cursor + 2],
                    script[cursor + 3],
                ]) as usize;
                cursor += 4 + len;
            }
            OP_1NEGATE | OP_1..=OP_16 => {}
            _ => return false,
        }
        if cursor > script.len() {
            return false;
        }
    }
    true
}

/// Counts legacy signature operations, the way `CScript::GetSigOpCount`
/// does without P2SH context.
pub fn legacy_sigops(script: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            0x01..=0x4b => {
                let len = opcode as usize;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA1 => {
                if cursor >= script.len() {
                    break;
                }
                let len = script[cursor] as usize;
                cursor += 1;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA4 => {
                if cursor + 4 > script.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    script[cursor],
                    script[cursor + 1],
                    script[cursor + 2],
                    script[cursor + 3],
                ]) as usize;
                cursor += 4;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            _ => {}
        }
    }
    count
}

pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else if data.len() <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    } else if data.len() <= u16::MAX as usize {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// `CScript << n`: small values become the dedicated opcodes, everything
/// else a minimal-number push.
pub fn push_int64(script: &mut Vec<u8>, value: i64) {
    if value == -1 {
        script.push(OP_1NEGATE);
        return;
    }
    if (1..=16).contains(&value) {
        script.push(OP_1 + (value as u8 - 1));
        return;
    }
    if value == 0 {
        script.push(OP_0);
        return;
    }
    let data = script_num_serialize(value);
    push_data(script, &data);
}

pub fn script_num_serialize(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}

/// The script prefix a coinbase at `height` must start with.
pub fn height_script_prefix(height: i32) -> Vec<u8> {
    let mut script = Vec::new();
    push_int64(&mut script, height as i64);
    script
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}
