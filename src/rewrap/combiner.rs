//! Split-key combination.
//!
//! All-of groups carry XOR shares of equal length: the key is the XOR of
//! every share and any strict subset is indistinguishable from random.
//! Any-of groups carry full copies of the key; one available share is
//! enough.

use rand_core::{OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

pub const MIN_ALL_OF_SHARES: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CombineError {
    #[error("all-of reconstruction needs at least 2 shares, got {0}")]
    TooFewShares(usize),

    #[error("share {index} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("share {0} is empty")]
    EmptyShare(usize),

    #[error("no share available")]
    NoShareAvailable,
}

/// XOR-combine all shares. Every share must be non-empty and the same length.
pub fn combine_all_of<S: AsRef<[u8]>>(shares: &[S]) -> Result<Zeroizing<Vec<u8>>, CombineError> {
    if shares.len() < MIN_ALL_OF_SHARES {
        return Err(CombineError::TooFewShares(shares.len()));
    }

    let expected = shares[0].as_ref().len();
    let mut key = Zeroizing::new(vec![0u8; expected]);
    for (index, share) in shares.iter().enumerate() {
        let share = share.as_ref();
        if share.is_empty() {
            return Err(CombineError::EmptyShare(index));
        }
        if share.len() != expected {
            return Err(CombineError::LengthMismatch {
                index,
                expected,
                actual: share.len(),
            });
        }
        for (k, s) in key.iter_mut().zip(share) {
            *k ^= s;
        }
    }
    Ok(key)
}

/// First available share in member order.
pub fn select_any_of<S, I>(shares: I) -> Result<S, CombineError>
where
    I: IntoIterator<Item = Option<S>>,
{
    shares
        .into_iter()
        .flatten()
        .next()
        .ok_or(CombineError::NoShareAvailable)
}

/// Split `secret` into `n` XOR shares: `n - 1` random shares and one
/// corrective share.
pub fn split_all_of(secret: &[u8], n: usize) -> Result<Vec<Zeroizing<Vec<u8>>>, CombineError> {
    if n < MIN_ALL_OF_SHARES {
        return Err(CombineError::TooFewShares(n));
    }
    if secret.is_empty() {
        return Err(CombineError::EmptyShare(0));
    }

    let mut corrective = Zeroizing::new(secret.to_vec());
    let mut shares = Vec::with_capacity(n);
    for _ in 1..n {
        let mut share = Zeroizing::new(vec![0u8; secret.len()]);
        OsRng.fill_bytes(&mut share);
        for (c, s) in corrective.iter_mut().zip(share.iter()) {
            *c ^= s;
        }
        shares.push(share);
    }
    shares.push(corrective);
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_then_combine_recovers_secret() {
        let secret = [0xA5u8; 32];
        for n in 2..=5 {
            let shares = split_all_of(&secret, n).unwrap();
            assert_eq!(shares.len(), n);
            assert_eq!(combine_all_of(&shares).unwrap().as_slice(), &secret);
        }
    }

    #[test]
    fn test_missing_share_does_not_recover() {
        let secret = [0x11u8; 32];
        let shares = split_all_of(&secret, 3).unwrap();
        let partial = combine_all_of(&shares[..2]).unwrap();
        assert_ne!(partial.as_slice(), &secret);
    }

    #[test]
    fn test_xor_is_order_independent() {
        let shares = vec![vec![0x0Fu8, 0xF0], vec![0xFF, 0x00], vec![0x01, 0x10]];
        let forward = combine_all_of(&shares).unwrap();
        let reversed: Vec<Vec<u8>> = shares.iter().rev().cloned().collect();
        assert_eq!(forward, combine_all_of(&reversed).unwrap());
        assert_eq!(forward.as_slice(), &[0xF1, 0xE0]);
    }

    #[test]
    fn test_single_share_rejected() {
        let shares = vec![vec![1u8; 32]];
        assert_eq!(combine_all_of(&shares), Err(CombineError::TooFewShares(1)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let shares = vec![vec![1u8; 32], vec![2u8; 31]];
        assert_eq!(
            combine_all_of(&shares),
            Err(CombineError::LengthMismatch {
                index: 1,
                expected: 32,
                actual: 31
            })
        );
    }

    #[test]
    fn test_empty_share_rejected() {
        let shares: Vec<Vec<u8>> = vec![vec![], vec![]];
        assert_eq!(combine_all_of(&shares), Err(CombineError::EmptyShare(0)));
    }

    #[test]
    fn test_select_any_of_skips_unavailable() {
        let shares = vec![None, Some(vec![2u8]), Some(vec![3u8])];
        assert_eq!(select_any_of(shares).unwrap(), vec![2u8]);

        let none: Vec<Option<Vec<u8>>> = vec![None, None];
        assert_eq!(select_any_of(none), Err(CombineError::NoShareAvailable));
    }
}
