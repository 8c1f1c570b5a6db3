// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bidirectional mapping between a 32-bit segment identifier and the
//! `(class, instance, namespace-id, role)` tuple it encodes.
//!
//! No other module may crack key bits itself; everything goes through
//! [`decode`] and [`encode`].

/// Class byte occupying bits 24..31 of a key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyClass {
    /// Primary index segments (base, tree-index, primary stages).
    Primary,
    /// Secondary index segments (meta, secondary stages).
    Secondary,
    /// Data segments.
    Data,
}

impl KeyClass {
    const PRIMARY: u8 = 0xAE;
    const SECONDARY: u8 = 0xA2;
    const DATA: u8 = 0xAD;
}

impl From<KeyClass> for u8 {
    fn from(value: KeyClass) -> Self {
        match value {
            KeyClass::Primary => KeyClass::PRIMARY,
            KeyClass::Secondary => KeyClass::SECONDARY,
            KeyClass::Data => KeyClass::DATA,
        }
    }
}

impl TryFrom<u8> for KeyClass {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::PRIMARY => Ok(Self::Primary),
            Self::SECONDARY => Ok(Self::Secondary),
            Self::DATA => Ok(Self::Data),
            other => Err(KeyError::InvalidClass(other)),
        }
    }
}

/// The lowest and highest stage ordinal a stage role may carry, per class.
const STAGE_MIN: u16 = 0x100;
const STAGE_MAX: u16 = 0x8FF;

/// Role of a segment within its namespace group, as decoded from the low
/// 12 bits of the key. The *meaning* of role `0` depends on [`KeyClass`]
/// (base under Primary, meta under Secondary, stage 0 under Data).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// Primary-class role 0: the root segment of a namespace.
    Base,
    /// Primary-class role 1: opaque to this tool.
    TreeIndex,
    /// Secondary-class role 0: analogous to [`Role::Base`] for secondary indexes.
    Meta,
    /// An arena-class segment at the given stage ordinal.
    ///
    /// Valid range is `0x100..=0x8FF` under Primary/Secondary, and
    /// `0..=0x8FF` under Data.
    Stage(u16),
}

/// A fully decoded segment key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DecodedKey {
    /// Which of the three segment classes this key belongs to.
    pub class: KeyClass,
    /// Server instance number, `0..=15`.
    pub instance: u8,
    /// Logical namespace id, `1..=32`.
    pub namespace_id: u8,
    /// Role within the namespace group.
    pub role: Role,
}

impl DecodedKey {
    /// Returns the stage ordinal if this key is a stage, `None` otherwise.
    #[must_use]
    pub fn stage_ordinal(&self) -> Option<u16> {
        match self.role {
            Role::Stage(ordinal) => Some(ordinal),
            _ => None,
        }
    }
}

/// Everything that can be wrong with a 32-bit value as a segment key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyError {
    /// Top byte did not match `PRIMARY`, `SECONDARY`, or `DATA`.
    InvalidClass(u8),
    /// Instance nibble exceeded 15 (unreachable via a true 4-bit extraction,
    /// kept as an explicit check for resilience against a future field-width
    /// change).
    InvalidInstance(u8),
    /// Namespace id was 0 or exceeded 32.
    InvalidNamespaceId(u8),
    /// Role bits did not correspond to a valid role for this class.
    InvalidRole { class: KeyClass, role: u16 },
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidClass(b) => write!(f, "invalid key class byte {b:#04x}"),
            Self::InvalidInstance(i) => write!(f, "invalid instance {i} (must be 0..=15)"),
            Self::InvalidNamespaceId(n) => {
                write!(f, "invalid namespace id {n} (must be 1..=32)")
            }
            Self::InvalidRole { class, role } => {
                write!(f, "invalid role {role:#05x} for class {class:?}")
            }
        }
    }
}

impl std::error::Error for KeyError {}

/// Decodes a 32-bit segment identifier into its constituent fields.
///
/// Layout: `[class:8][instance:4][namespace-id:8][role:12]`.
pub fn decode(key: u32) -> Result<DecodedKey, KeyError> {
    let class_byte = (key >> 24) as u8;
    let class = KeyClass::try_from(class_byte)?;

    let instance = ((key >> 20) & 0xF) as u8;
    if instance > 15 {
        return Err(KeyError::InvalidInstance(instance));
    }

    let namespace_id = ((key >> 12) & 0xFF) as u8;
    if namespace_id < 1 || namespace_id > 32 {
        return Err(KeyError::InvalidNamespaceId(namespace_id));
    }

    let role_bits = (key & 0xFFF) as u16;

    let role = match class {
        KeyClass::Primary => match role_bits {
            0 => Role::Base,
            1 => Role::TreeIndex,
            ordinal if (STAGE_MIN..=STAGE_MAX).contains(&ordinal) => Role::Stage(ordinal),
            role => {
                return Err(KeyError::InvalidRole { class, role });
            }
        },
        KeyClass::Secondary => match role_bits {
            0 => Role::Meta,
            ordinal if (STAGE_MIN..=STAGE_MAX).contains(&ordinal) => Role::Stage(ordinal),
            role => {
                return Err(KeyError::InvalidRole { class, role });
            }
        },
        KeyClass::Data => {
            if role_bits <= STAGE_MAX {
                Role::Stage(role_bits)
            } else {
                return Err(KeyError::InvalidRole {
                    class,
                    role: role_bits,
                });
            }
        }
    };

    Ok(DecodedKey {
        class,
        instance,
        namespace_id,
        role,
    })
}

/// Encodes a decoded key back into its canonical 32-bit representation.
#[must_use]
pub fn encode(decoded: &DecodedKey) -> u32 {
    let class_byte = u8::from(decoded.class);
    let role_bits: u16 = match decoded.role {
        Role::Base | Role::Meta => 0,
        Role::TreeIndex => 1,
        Role::Stage(ordinal) => ordinal,
    };

    (u32::from(class_byte) << 24)
        | (u32::from(decoded.instance) << 20)
        | (u32::from(decoded.namespace_id) << 12)
        | u32::from(role_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base() {
        let d = decode(0xAE00_1000).expect("should decode");
        assert_eq!(d.class, KeyClass::Primary);
        assert_eq!(d.instance, 0);
        assert_eq!(d.namespace_id, 1);
        assert_eq!(d.role, Role::Base);
    }

    #[test]
    fn decodes_tree_index() {
        let d = decode(0xAE00_1001).expect("should decode");
        assert_eq!(d.role, Role::TreeIndex);
    }

    #[test]
    fn decodes_primary_stage_boundaries() {
        let low = decode(0xAE00_1100).expect("should decode");
        assert_eq!(low.role, Role::Stage(0x100));

        let high = decode(0xAE00_18FF).expect("should decode");
        assert_eq!(high.role, Role::Stage(0x8FF));
    }

    #[test]
    fn rejects_tree_index_under_secondary() {
        let err = decode(0xA200_1001).unwrap_err();
        assert!(matches!(err, KeyError::InvalidRole { .. }));
    }

    #[test]
    fn rejects_role_gap_between_tree_index_and_stage() {
        let err = decode(0xAE00_1002).unwrap_err();
        assert!(matches!(err, KeyError::InvalidRole { .. }));
    }

    #[test]
    fn data_class_accepts_role_zero_as_stage() {
        let d = decode(0xAD00_100C).expect("should decode");
        assert_eq!(d.role, Role::Stage(0x00C));
    }

    #[test]
    fn data_class_rejects_role_past_max() {
        let err = decode(0xAD00_1900).unwrap_err();
        assert!(matches!(err, KeyError::InvalidRole { .. }));
    }

    #[test]
    fn rejects_bad_class_byte() {
        let err = decode(0xFF00_1000).unwrap_err();
        assert_eq!(err, KeyError::InvalidClass(0xFF));
    }

    #[test]
    fn rejects_namespace_id_zero() {
        let err = decode(0xAE00_0000).unwrap_err();
        assert_eq!(err, KeyError::InvalidNamespaceId(0));
    }

    #[test]
    fn rejects_namespace_id_above_32() {
        // namespace-id field = 33 (0x21)
        let err = decode(0xAE02_1000).unwrap_err();
        assert_eq!(err, KeyError::InvalidNamespaceId(33));
    }

    #[test]
    fn instance_boundaries_roundtrip() {
        for instance in [0u8, 15] {
            let d = DecodedKey {
                class: KeyClass::Secondary,
                instance,
                namespace_id: 1,
                role: Role::Meta,
            };
            let k = encode(&d);
            assert_eq!(decode(k).expect("should decode"), d);
        }
    }

    #[test]
    fn full_codec_bijection_sweep() {
        // Exhaustively sweep the legal domain: every class, every instance,
        // namespace-ids 1 and 32, and every role kind.
        for class in [KeyClass::Primary, KeyClass::Secondary, KeyClass::Data] {
            for instance in 0u8..=15 {
                for namespace_id in [1u8, 32] {
                    let roles: Vec<Role> = match class {
                        KeyClass::Primary => {
                            vec![Role::Base, Role::TreeIndex, Role::Stage(0x100), Role::Stage(0x8FF)]
                        }
                        KeyClass::Secondary => {
                            vec![Role::Meta, Role::Stage(0x100), Role::Stage(0x8FF)]
                        }
                        KeyClass::Data => vec![Role::Stage(0), Role::Stage(1), Role::Stage(0x8FF)],
                    };

                    for role in roles {
                        let d = DecodedKey {
                            class,
                            instance,
                            namespace_id,
                            role,
                        };
                        let k = encode(&d);
                        assert_eq!(decode(k).expect("should decode"), d);
                        assert_eq!(encode(&decode(k).expect("should decode")), k);
                    }
                }
            }
        }
    }
}
