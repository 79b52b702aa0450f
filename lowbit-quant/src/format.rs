use anyhow::Result;

/// Number of source elements in one block of the legacy block formats.
pub const QK: usize = 32;

/// Element type codes as they appear in the streaming tensor format.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    I8 = 16,
    I16 = 17,
    I32 = 18,
    Packed = 19,
}

impl TryFrom<i32> for ElementType {
    type Error = anyhow::Error;

    fn try_from(code: i32) -> Result<Self> {
        let ty = match code {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            16 => Self::I8,
            17 => Self::I16,
            18 => Self::I32,
            19 => Self::Packed,
            _ => anyhow::bail!("Unknown element type code: {code}"),
        };
        Ok(ty)
    }
}

impl ElementType {
    pub fn code(self) -> i32 {
        self as u32 as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q8_0 => "q8_0",
            Self::Q8_1 => "q8_1",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::Packed => "packed",
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 | Self::Packed)
    }

    /// Returns the block codec for this type, if it is one of the encodable block formats.
    pub fn block_format(self) -> Option<BlockFormat> {
        match self {
            Self::Q4_0 => Some(BlockFormat::Q4_0),
            Self::Q4_1 => Some(BlockFormat::Q4_1),
            Self::Q5_0 => Some(BlockFormat::Q5_0),
            Self::Q5_1 => Some(BlockFormat::Q5_1),
            Self::Q8_0 => Some(BlockFormat::Q8_0),
            _ => None,
        }
    }

    /// Payload size in bytes for `n_elements` values.
    ///
    /// Returns `None` for the packed type, whose payload describes its own size.
    pub fn payload_size(self, n_elements: usize) -> Option<usize> {
        let size = match self {
            Self::F32 | Self::I32 => n_elements * 4,
            Self::F16 | Self::I16 => n_elements * 2,
            Self::I8 => n_elements,
            Self::Q8_1 => n_elements / QK * 40,
            Self::Packed => return None,
            other => {
                let format = other.block_format()?;
                n_elements / QK * format.block_bytes()
            }
        };
        Some(size)
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Block quantization formats with a fixed block of [`QK`] elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockFormat {
    /// 4-bit symmetric: f16 scale, 16 bytes of nibbles.
    Q4_0,
    /// 4-bit asymmetric: f16 scale, f16 minimum, 16 bytes of nibbles.
    Q4_1,
    /// 5-bit symmetric: f16 scale, 32-bit high-bit mask, 16 bytes of nibbles.
    Q5_0,
    /// 5-bit asymmetric: f16 scale, f16 minimum, 32-bit high-bit mask, 16 bytes of nibbles.
    Q5_1,
    /// 8-bit symmetric: f16 scale, 32 signed bytes.
    Q8_0,
}

impl BlockFormat {
    pub fn bits(self) -> u32 {
        match self {
            Self::Q4_0 | Self::Q4_1 => 4,
            Self::Q5_0 | Self::Q5_1 => 5,
            Self::Q8_0 => 8,
        }
    }

    pub fn is_symmetric(self) -> bool {
        matches!(self, Self::Q4_0 | Self::Q5_0 | Self::Q8_0)
    }

    pub fn block_bytes(self) -> usize {
        match self {
            Self::Q4_0 => 2 + QK / 2,
            Self::Q4_1 => 4 + QK / 2,
            Self::Q5_0 => 2 + 4 + QK / 2,
            Self::Q5_1 => 4 + 4 + QK / 2,
            Self::Q8_0 => 2 + QK,
        }
    }

    pub fn element_type(self) -> ElementType {
        match self {
            Self::Q4_0 => ElementType::Q4_0,
            Self::Q4_1 => ElementType::Q4_1,
            Self::Q5_0 => ElementType::Q5_0,
            Self::Q5_1 => ElementType::Q5_1,
            Self::Q8_0 => ElementType::Q8_0,
        }
    }

    /// Largest magnitude of a symmetric code, `2^(bits-1) - 1`.
    pub fn max_symmetric_code(self) -> i32 {
        (1 << (self.bits() - 1)) - 1
    }

    /// Number of unsigned code levels minus one, `2^bits - 1`.
    pub fn max_unsigned_code(self) -> i32 {
        (1 << self.bits()) - 1
    }
}
