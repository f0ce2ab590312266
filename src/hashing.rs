//! EIP-712 typed-data hashing for compacts.
//!
//! The digest produced here is what the allocator signs and what the on-chain
//! verifier recomputes, so the encoding must match it bit for bit: domain
//! `("The Compact", "0", chainId, verifying contract)`, struct schema switched
//! by witness presence, final digest `keccak256(0x1901 || domainSeparator ||
//! structHash)`.

use alloy_primitives::{Address, B256, address};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain};

use crate::types::{ChainId, Compact};

/// The Compact verifier deployment, identical on every supported chain.
pub const VERIFYING_CONTRACT: Address = address!("00000000000018DF021Ff2467dF97ff846E09f48");

const DOMAIN_NAME: &str = "The Compact";
const DOMAIN_VERSION: &str = "0";

// Both schemas share the primary type name `Compact`; the sol! struct name
// feeds the EIP-712 type hash, hence one module per schema.

mod plain {
    use alloy_sol_types::sol;

    sol! {
        /// The witness-free compact schema.
        struct Compact {
            address arbiter;
            address sponsor;
            uint256 nonce;
            uint256 expires;
            uint256 id;
            uint256 amount;
        }
    }
}

mod witnessed {
    use alloy_sol_types::sol;

    sol! {
        /// The witnessed compact schema: the base fields plus the
        /// sponsor-chosen witness type string and its hash.
        struct Compact {
            address arbiter;
            address sponsor;
            uint256 nonce;
            uint256 expires;
            uint256 id;
            uint256 amount;
            string witnessTypeString;
            bytes32 witnessHash;
        }
    }
}

/// The EIP-712 domain for a chain.
pub fn domain(chain_id: ChainId) -> Eip712Domain {
    eip712_domain! {
        name: DOMAIN_NAME,
        version: DOMAIN_VERSION,
        chain_id: chain_id.value(),
        verifying_contract: VERIFYING_CONTRACT,
    }
}

/// Computes the claim hash of a compact: the EIP-712 signing digest that the
/// allocator co-signs and arbiters verify on-chain.
///
/// Witness presence selects the schema; the compact must already satisfy the
/// both-or-neither witness invariant.
pub fn claim_hash(compact: &Compact, chain_id: ChainId) -> B256 {
    let domain = domain(chain_id);
    match (&compact.witness_type_string, &compact.witness_hash) {
        (Some(witness_type_string), Some(witness_hash)) => {
            let message = witnessed::Compact {
                arbiter: compact.arbiter.into(),
                sponsor: compact.sponsor.into(),
                nonce: compact.nonce.into(),
                expires: compact.expires.into(),
                id: compact.id.into(),
                amount: compact.amount.into(),
                witnessTypeString: witness_type_string.clone(),
                witnessHash: *witness_hash,
            };
            message.eip712_signing_hash(&domain)
        }
        _ => {
            let message = plain::Compact {
                arbiter: compact.arbiter.into(),
                sponsor: compact.sponsor.into(),
                nonce: compact.nonce.into(),
                expires: compact.expires.into(),
                id: compact.id.into(),
                amount: compact.amount.into(),
            };
            message.eip712_signing_hash(&domain)
        }
    }
}
