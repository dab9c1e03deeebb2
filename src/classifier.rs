//! Contract Classifier: assigns an interface type to a freshly deployed
//! contract from its bytecode, then reads type-specific metadata via view
//! calls.
//!
//! Selectors are derived at startup from canonical function signatures via
//! `keccak256` (design notes, §9) rather than hand-copied literals, so the
//! mapping stays auditable against the signature strings below.

use std::collections::BTreeSet;

use alloy_primitives::keccak256;

use crate::chain::ChainAdapter;
use crate::error::ClassifierError;
use crate::model::{ContractMetadata, ContractType};

const PUSH4_OPCODE: u8 = 0x63;
const DELEGATECALL_OPCODE: u8 = 0xf4;
/// `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`
const EIP1967_IMPLEMENTATION_SLOT: &str =
    "360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bb";

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

struct Interface {
    ty: ContractType,
    /// Function signatures whose selectors count toward this interface.
    selectors: &'static [&'static str],
    /// Minimum number of the above selectors that must be present.
    required_matches: usize,
}

fn interfaces() -> Vec<Interface> {
    vec![
        Interface {
            ty: ContractType::Erc20,
            selectors: &[
                "totalSupply()",
                "balanceOf(address)",
                "transfer(address,uint256)",
                "approve(address,uint256)",
                "allowance(address,address)",
                "transferFrom(address,address,uint256)",
            ],
            required_matches: 5,
        },
        Interface {
            ty: ContractType::Erc721,
            selectors: &[
                "balanceOf(address)",
                "ownerOf(uint256)",
                "safeTransferFrom(address,address,uint256)",
                "transferFrom(address,address,uint256)",
                "approve(address,uint256)",
                "setApprovalForAll(address,bool)",
            ],
            required_matches: 4,
        },
        Interface {
            ty: ContractType::Erc1155,
            selectors: &[
                "balanceOf(address,uint256)",
                "balanceOfBatch(address[],uint256[])",
                "setApprovalForAll(address,bool)",
                "isApprovedForAll(address,address)",
                "safeTransferFrom(address,address,uint256,uint256,bytes)",
                "safeBatchTransferFrom(address,address,uint256[],uint256[],bytes)",
            ],
            required_matches: 3,
        },
        Interface {
            ty: ContractType::Router,
            selectors: &[
                "swapExactTokensForTokens(uint256,uint256,address[],address,uint256)",
                "swapETHForExactTokens(uint256,address[],address,uint256)",
                "swapExactETHForTokens(uint256,address[],address,uint256)",
                "addLiquidity(address,address,uint256,uint256,uint256,uint256,address,uint256)",
                "removeLiquidity(address,address,uint256,uint256,uint256,address,uint256)",
            ],
            required_matches: 2,
        },
        Interface {
            ty: ContractType::Pool,
            selectors: &["token0()", "token1()"],
            required_matches: 2,
        },
        Interface {
            ty: ContractType::Staking,
            selectors: &["stake(uint256)", "withdraw(uint256)", "getReward()"],
            required_matches: 2,
        },
        Interface {
            ty: ContractType::Multisig,
            selectors: &[
                "submitTransaction(address,uint256,bytes)",
                "confirmTransaction(uint256)",
                "executeTransaction(uint256)",
                "getOwners()",
            ],
            required_matches: 2,
        },
        Interface {
            ty: ContractType::Timelock,
            selectors: &[
                "queueTransaction(address,uint256,string,bytes,uint256)",
                "executeTransaction(address,uint256,string,bytes,uint256)",
                "GRACE_PERIOD()",
                "delay()",
            ],
            required_matches: 2,
        },
    ]
}

/// The result of scanning bytecode: a primary type, every interface that
/// matched, and its confidence.
pub struct ClassificationOutcome {
    pub primary_type: ContractType,
    pub matched_types: BTreeSet<ContractType>,
    pub confidence: f64,
    pub bytecode_size: usize,
}

/// Scans `code` for 4-byte `PUSH4` selectors and scores every known interface.
fn scan_bytecode(code: &[u8]) -> ClassificationOutcome {
    let mut present = BTreeSet::new();
    let mut i = 0;
    while i + 4 < code.len() {
        if code[i] == PUSH4_OPCODE {
            present.insert([code[i + 1], code[i + 2], code[i + 3], code[i + 4]]);
            i += 5;
        } else {
            i += 1;
        }
    }

    let is_proxy = code
        .windows(32)
        .take(1)
        .any(|w| w.contains(&DELEGATECALL_OPCODE))
        || hex::encode(code).contains(EIP1967_IMPLEMENTATION_SLOT);

    let mut matched_types = BTreeSet::new();
    let mut best: Option<(ContractType, f64)> = None;
    let mut consider = |ty: ContractType, confidence: f64, matched_types: &mut BTreeSet<ContractType>, best: &mut Option<(ContractType, f64)>| {
        matched_types.insert(ty);
        *best = Some(match *best {
            None => (ty, confidence),
            Some((best_ty, best_conf)) => {
                if confidence > best_conf
                    || (confidence == best_conf && ty.tie_break_rank() < best_ty.tie_break_rank())
                {
                    (ty, confidence)
                } else {
                    (best_ty, best_conf)
                }
            }
        });
    };

    for iface in interfaces() {
        let matched = iface
            .selectors
            .iter()
            .filter(|sig| present.contains(&selector(sig)))
            .count();
        if matched >= iface.required_matches {
            let confidence = (matched as f64 / iface.required_matches as f64).min(1.0);
            consider(iface.ty, confidence, &mut matched_types, &mut best);
        }
    }

    if is_proxy {
        consider(ContractType::Proxy, 1.0, &mut matched_types, &mut best);
    }

    let (primary_type, confidence) = best.unwrap_or((ContractType::Unknown, 0.0));
    ClassificationOutcome {
        primary_type,
        matched_types,
        confidence,
        bytecode_size: code.len(),
    }
}

fn left_pad_address(address: &str) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    if let Ok(bytes) = hex::decode(address.trim_start_matches("0x")) {
        let start = 32usize.saturating_sub(bytes.len());
        out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(20)..]);
    }
    out
}

fn decode_string(data: &[u8]) -> Option<String> {
    // Standard dynamic `string` ABI encoding: word 0 is the offset (almost
    // always 32), word at that offset is the length, followed by the bytes.
    if data.len() < 64 {
        // Some legacy ERC20s (e.g. MKR) return a fixed bytes32 instead.
        let trimmed: Vec<u8> = data.iter().copied().take_while(|&b| b != 0).collect();
        return String::from_utf8(trimmed).ok().filter(|s| !s.is_empty());
    }
    let len = u32::from_be_bytes(data[60..64].try_into().ok()?) as usize;
    let bytes = data.get(64..64 + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn decode_u8(data: &[u8]) -> Option<u8> {
    data.last().copied()
}

fn decode_u256_decimal(data: &[u8]) -> Option<String> {
    if data.len() < 32 {
        return None;
    }
    let mut value = num_bigint_be(&data[data.len() - 32..]);
    if value.is_empty() {
        value = "0".to_string();
    }
    Some(value)
}

/// Minimal big-endian-bytes-to-decimal-string conversion without pulling in a
/// bignum crate: repeated divide-by-10 over the 32-byte big-endian value.
fn num_bigint_be(bytes: &[u8]) -> String {
    let mut digits = bytes.to_vec();
    let mut out = Vec::new();
    loop {
        let mut remainder: u32 = 0;
        let mut any_nonzero = false;
        for byte in digits.iter_mut() {
            let acc = (remainder << 8) | *byte as u32;
            *byte = (acc / 10) as u8;
            remainder = acc % 10;
            if *byte != 0 {
                any_nonzero = true;
            }
        }
        out.push(b'0' + remainder as u8);
        if !any_nonzero {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_else(|_| "0".to_string())
}

fn decode_address(data: &[u8]) -> Option<String> {
    if data.len() < 32 {
        return None;
    }
    Some(format!("0x{}", hex::encode(&data[data.len() - 20..])))
}

/// Classifies `address`: fetches bytecode, scores every known interface, then
/// attempts to read metadata for the winning interface. View-call failures
/// set the corresponding field to absent and never abort classification.
pub async fn classify(
    adapter: &dyn ChainAdapter,
    address: &str,
) -> (ClassificationOutcome, ContractMetadata) {
    let code = match adapter.get_code(address).await {
        Ok(code) => code,
        Err(e) => {
            let err = ClassifierError::BytecodeFetch {
                address: address.to_string(),
                source: e,
            };
            tracing::warn!(chain = %adapter.chain_name(), address, error = %err, "bytecode fetch failed, classifying as Error");
            return (
                ClassificationOutcome {
                    primary_type: ContractType::Error,
                    matched_types: BTreeSet::new(),
                    confidence: 0.0,
                    bytecode_size: 0,
                },
                ContractMetadata::default(),
            );
        }
    };

    if code.is_empty() {
        return (
            ClassificationOutcome {
                primary_type: ContractType::Unknown,
                matched_types: BTreeSet::new(),
                confidence: 0.0,
                bytecode_size: 0,
            },
            ContractMetadata::default(),
        );
    }

    let outcome = scan_bytecode(&code);
    let metadata = read_metadata(adapter, address, outcome.primary_type).await;
    (outcome, metadata)
}

async fn view_call(adapter: &dyn ChainAdapter, address: &str, signature: &str, args: &[u8]) -> Option<Vec<u8>> {
    let sel = selector(signature);
    let mut calldata = sel.to_vec();
    calldata.extend_from_slice(args);
    match adapter.eth_call(address, &calldata).await {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::debug!(chain = %adapter.chain_name(), address, signature, error = %e, "view call failed");
            None
        }
    }
}

async fn read_metadata(
    adapter: &dyn ChainAdapter,
    address: &str,
    primary_type: ContractType,
) -> ContractMetadata {
    let mut metadata = ContractMetadata::default();
    match primary_type {
        ContractType::Erc20 => {
            metadata.name = view_call(adapter, address, "name()", &[]).await.and_then(|d| decode_string(&d));
            metadata.symbol = view_call(adapter, address, "symbol()", &[]).await.and_then(|d| decode_string(&d));
            metadata.decimals = view_call(adapter, address, "decimals()", &[]).await.and_then(|d| decode_u8(&d));
            metadata.total_supply = view_call(adapter, address, "totalSupply()", &[]).await.and_then(|d| decode_u256_decimal(&d));
        }
        ContractType::Erc721 => {
            metadata.name = view_call(adapter, address, "name()", &[]).await.and_then(|d| decode_string(&d));
            metadata.symbol = view_call(adapter, address, "symbol()", &[]).await.and_then(|d| decode_string(&d));
            metadata.total_supply = view_call(adapter, address, "totalSupply()", &[]).await.and_then(|d| decode_u256_decimal(&d));
        }
        ContractType::Pool => {
            metadata.pool_token0 = view_call(adapter, address, "token0()", &[]).await.and_then(|d| decode_address(&d));
            metadata.pool_token1 = view_call(adapter, address, "token1()", &[]).await.and_then(|d| decode_address(&d));
        }
        _ => {}
    }
    metadata
}

#[allow(dead_code)]
fn encode_address_arg(address: &str) -> Vec<u8> {
    left_pad_address(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push4(sig: &str) -> Vec<u8> {
        let sel = selector(sig);
        let mut v = vec![PUSH4_OPCODE];
        v.extend_from_slice(&sel);
        v
    }

    #[test]
    fn erc20_bytecode_classifies_as_erc20_with_full_confidence() {
        let mut code = Vec::new();
        for sig in [
            "totalSupply()",
            "balanceOf(address)",
            "transfer(address,uint256)",
            "approve(address,uint256)",
            "allowance(address,address)",
            "transferFrom(address,address,uint256)",
        ] {
            code.extend(push4(sig));
        }
        let outcome = scan_bytecode(&code);
        assert_eq!(outcome.primary_type, ContractType::Erc20);
        assert_eq!(outcome.confidence, 1.0);
        assert!(outcome.matched_types.contains(&ContractType::Erc20));
    }

    #[test]
    fn pool_selectors_classify_as_pool() {
        let mut code = Vec::new();
        code.extend(push4("token0()"));
        code.extend(push4("token1()"));
        let outcome = scan_bytecode(&code);
        assert_eq!(outcome.primary_type, ContractType::Pool);
        assert_eq!(outcome.confidence, 1.0);
    }

    #[test]
    fn empty_bytecode_scores_as_unknown() {
        let outcome = scan_bytecode(&[]);
        assert_eq!(outcome.primary_type, ContractType::Unknown);
        assert_eq!(outcome.confidence, 0.0);
    }

    #[test]
    fn decodes_u256_decimal_from_32_byte_word() {
        let mut data = vec![0u8; 32];
        data[31] = 42;
        assert_eq!(decode_u256_decimal(&data).unwrap(), "42");
    }

    #[test]
    fn decodes_short_ascii_string_return() {
        // Legacy fixed bytes32-style return, e.g. some pre-standard tokens.
        let mut data = vec![0u8; 32];
        data[..3].copy_from_slice(b"FOO");
        assert_eq!(decode_string(&data).unwrap(), "FOO");
    }
}
