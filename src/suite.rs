//! Seam to the group-arithmetic collaborator.
//!
//! conet never looks inside a group element: identities carry the marshaled
//! bytes of a public point, and everything else (addition, negation, scalar
//! multiplication) belongs to whichever algebra crate the application plugs
//! in behind these traits. The only capability the transport and overlay
//! rely on is the fixed-size binary round-trip.

use serde::{Deserialize, Serialize};

use crate::error::{ConetError, Result};

/// A scalar of the underlying group, seen only through its binary form.
pub trait Scalar: Clone + PartialEq + std::fmt::Debug + Send + Sync + Sized + 'static {
    /// Marshal to the suite's fixed-length scalar encoding.
    fn marshal_binary(&self) -> Result<Vec<u8>>;
    /// Rebuild from the fixed-length encoding.
    fn unmarshal_binary(data: &[u8]) -> Result<Self>;
}

/// A group element, seen only through its binary form plus the arithmetic
/// the application protocols need.
pub trait Element: Clone + PartialEq + std::fmt::Debug + Send + Sync + Sized + 'static {
    /// Scalar type this element multiplies with.
    type Scalar: Scalar;

    /// Marshal to the suite's fixed-length element encoding.
    fn marshal_binary(&self) -> Result<Vec<u8>>;
    /// Rebuild from the fixed-length encoding.
    fn unmarshal_binary(data: &[u8]) -> Result<Self>;

    /// Group addition.
    fn add(&self, other: &Self) -> Self;
    /// Group negation.
    fn neg(&self) -> Self;
    /// Scalar multiplication.
    fn mul(&self, scalar: &Self::Scalar) -> Self;
}

/// A cipher suite: the element/scalar pair and their encoded lengths.
pub trait Suite: Send + Sync + 'static {
    /// Element type of this suite.
    type Element: Element;

    /// Length in bytes of a marshaled element.
    fn element_len(&self) -> usize;
    /// Length in bytes of a marshaled scalar.
    fn scalar_len(&self) -> usize;
}

/// Marshaled public-key bytes of some suite's element.
///
/// This is what travels in an [`Identity`](crate::Identity): the overlay and
/// codec treat it as opaque fixed-size bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Wrap raw marshaled element bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Marshal an element into a public key.
    pub fn from_element<E: Element>(element: &E) -> Result<Self> {
        Ok(Self(element.marshal_binary()?))
    }

    /// The marshaled bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Rebuild the element this key was marshaled from.
    pub fn to_element<E: Element>(&self) -> Result<E> {
        E::unmarshal_binary(&self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(")?;
        for b in self.0.iter().take(4) {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..{}B)", self.0.len())
    }
}

/// A non-cryptographic placeholder suite for tests and demos.
///
/// The "group" is 32 bytes under per-byte wrapping arithmetic. It satisfies
/// the binary round-trip contract and nothing more; never use it where real
/// keys are expected.
pub mod testing {
    use super::*;

    /// Placeholder scalar: 32 bytes.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TestScalar(pub [u8; 32]);

    /// Placeholder element: 32 bytes.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TestElement(pub [u8; 32]);

    /// Placeholder suite over [`TestElement`]/[`TestScalar`].
    #[derive(Clone, Copy, Debug, Default)]
    pub struct TestSuite;

    impl Scalar for TestScalar {
        fn marshal_binary(&self) -> Result<Vec<u8>> {
            Ok(self.0.to_vec())
        }

        fn unmarshal_binary(data: &[u8]) -> Result<Self> {
            let bytes: [u8; 32] = data
                .try_into()
                .map_err(|_| ConetError::Unmarshal(format!("scalar must be 32 bytes, got {}", data.len())))?;
            Ok(Self(bytes))
        }
    }

    impl Element for TestElement {
        type Scalar = TestScalar;

        fn marshal_binary(&self) -> Result<Vec<u8>> {
            Ok(self.0.to_vec())
        }

        fn unmarshal_binary(data: &[u8]) -> Result<Self> {
            let bytes: [u8; 32] = data
                .try_into()
                .map_err(|_| ConetError::Unmarshal(format!("element must be 32 bytes, got {}", data.len())))?;
            Ok(Self(bytes))
        }

        fn add(&self, other: &Self) -> Self {
            let mut out = [0u8; 32];
            for (i, o) in out.iter_mut().enumerate() {
                *o = self.0[i].wrapping_add(other.0[i]);
            }
            Self(out)
        }

        fn neg(&self) -> Self {
            let mut out = [0u8; 32];
            for (i, o) in out.iter_mut().enumerate() {
                *o = self.0[i].wrapping_neg();
            }
            Self(out)
        }

        fn mul(&self, scalar: &TestScalar) -> Self {
            let mut out = [0u8; 32];
            for (i, o) in out.iter_mut().enumerate() {
                *o = self.0[i].wrapping_mul(scalar.0[i]);
            }
            Self(out)
        }
    }

    impl Suite for TestSuite {
        type Element = TestElement;

        fn element_len(&self) -> usize {
            32
        }

        fn scalar_len(&self) -> usize {
            32
        }
    }

    impl TestElement {
        /// A deterministic element derived from a small seed, handy in tests.
        pub fn from_seed(seed: u8) -> Self {
            Self([seed; 32])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn element_roundtrip() {
        let e = TestElement::from_seed(7);
        let bytes = e.marshal_binary().unwrap();
        assert_eq!(bytes.len(), TestSuite.element_len());
        let back = TestElement::unmarshal_binary(&bytes).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn element_rejects_wrong_length() {
        assert!(matches!(
            TestElement::unmarshal_binary(&[1, 2, 3]),
            Err(ConetError::Unmarshal(_))
        ));
    }

    #[test]
    fn add_neg_cancel() {
        let e = TestElement::from_seed(9);
        let zero = e.add(&e.neg());
        assert_eq!(zero, TestElement([0u8; 32]));
    }

    #[test]
    fn public_key_wraps_element() {
        let e = TestElement::from_seed(3);
        let pk = PublicKey::from_element(&e).unwrap();
        assert_eq!(pk.as_bytes().len(), 32);
        assert_eq!(pk.to_element::<TestElement>().unwrap(), e);
    }
}
