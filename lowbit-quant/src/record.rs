use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};

use crate::format::ElementType;
use crate::packed::{PACKED_HEADER_SIZE, PackedLayout, read_packed_payload};

/// Longest tensor name accepted when reading a record.
const MAX_NAME_LENGTH: usize = 1 << 16;

/// Framing that precedes every tensor payload in the streaming format:
/// `i32 n_dims, i32 name_length, i32 element_type, i32 dims[n_dims], name bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub name: String,
    pub element_type: ElementType,
    /// Extents, innermost first (`ne[0]` is the row length).
    pub ne: Vec<usize>,
}

impl RecordHeader {
    pub fn new(name: &str, element_type: ElementType, ne: &[usize]) -> Self {
        Self { name: name.to_string(), element_type, ne: ne.to_vec() }
    }

    pub fn n_elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Reads the next header; `None` at a clean end of stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let n_dims = match reader.read_i32::<LittleEndian>() {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read tensor record"),
        };

        macro_rules! read_i32 {
            ($field:literal) => {
                reader.read_i32::<LittleEndian>().with_context(|| format!("Failed to read {}", $field))?
            };
        }

        let name_length = read_i32!("tensor name length");
        let type_code = read_i32!("element type");

        if !(1..=4).contains(&n_dims) {
            anyhow::bail!("Invalid tensor dimension count: {n_dims}");
        }
        if name_length < 0 || name_length as usize > MAX_NAME_LENGTH {
            anyhow::bail!("Invalid tensor name length: {name_length}");
        }

        let ne = (0..n_dims)
            .map(|_| {
                let dim = read_i32!("tensor dimension");
                if dim <= 0 {
                    anyhow::bail!("Invalid tensor dimension: {dim}");
                }
                Ok(dim as usize)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut name = vec![0u8; name_length as usize];
        reader.read_exact(&mut name).context("Failed to read tensor name")?;
        let name = String::from_utf8(name).context("Tensor name is not valid UTF-8")?;

        let element_type =
            ElementType::try_from(type_code).with_context(|| format!("Tensor '{name}' has an invalid element type"))?;

        Ok(Some(Self { name, element_type, ne }))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<LittleEndian>(self.ne.len() as i32)?;
        writer.write_i32::<LittleEndian>(self.name.len() as i32)?;
        writer.write_i32::<LittleEndian>(self.element_type.code())?;
        self.ne.iter().try_for_each(|&d| writer.write_i32::<LittleEndian>(d as i32))?;
        writer.write_all(self.name.as_bytes())?;
        Ok(())
    }

    /// Payload size of this record.
    ///
    /// `leading` must start at the payload; only packed records look at it.
    pub fn payload_size(&self, leading: &[u8]) -> Result<usize> {
        match self.element_type.payload_size(self.n_elements()) {
            Some(size) => Ok(size),
            None => {
                let header = leading.get(..PACKED_HEADER_SIZE).ok_or_else(|| {
                    anyhow::anyhow!("Truncated packed payload for tensor '{}'", self.name)
                })?;
                Ok(PackedLayout::parse(header)?.serialized_size())
            }
        }
    }

    /// Reads the raw payload following this header.
    pub fn read_payload<R: Read>(&self, reader: &mut R) -> Result<Vec<u8>> {
        if self.element_type == ElementType::Packed {
            return read_packed_payload(reader).with_context(|| format!("Failed to read tensor '{}'", self.name));
        }

        let size = self.payload_size(&[])?;
        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).with_context(|| format!("Failed to read data of tensor '{}'", self.name))?;
        Ok(payload)
    }
}

/// A complete tensor record: framing plus raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

impl TensorRecord {
    /// Builds an f32 record; `data.len()` must match the product of `ne`.
    pub fn from_f32(name: &str, ne: &[usize], data: &[f32]) -> Result<Self> {
        let header = RecordHeader::new(name, ElementType::F32, ne);
        if header.n_elements() != data.len() {
            anyhow::bail!("Tensor '{name}' expects {} values, got {}", header.n_elements(), data.len());
        }
        let mut payload = Vec::with_capacity(data.len() * 4);
        data.iter().try_for_each(|&v| payload.write_f32::<LittleEndian>(v))?;
        Ok(Self { header, payload })
    }

    /// Builds an f16 record from f32 values.
    pub fn from_f16(name: &str, ne: &[usize], data: &[f32]) -> Result<Self> {
        let header = RecordHeader::new(name, ElementType::F16, ne);
        if header.n_elements() != data.len() {
            anyhow::bail!("Tensor '{name}' expects {} values, got {}", header.n_elements(), data.len());
        }
        let mut payload = Vec::with_capacity(data.len() * 2);
        data.iter().try_for_each(|&v| payload.write_u16::<LittleEndian>(half::f16::from_f32(v).to_bits()))?;
        Ok(Self { header, payload })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let Some(header) = RecordHeader::read_from(reader)? else {
            return Ok(None);
        };
        let payload = header.read_payload(reader)?;
        Ok(Some(Self { header, payload }))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }
}

/// Decodes an F32 or F16 payload into floats.
pub fn read_float_payload<R: Read>(reader: &mut R, header: &RecordHeader) -> Result<Vec<f32>> {
    let n = header.n_elements();
    let mut data = vec![0.0f32; n];
    match header.element_type {
        ElementType::F32 => reader.read_f32_into::<LittleEndian>(&mut data)?,
        ElementType::F16 => {
            let mut raw = vec![0u16; n];
            reader.read_u16_into::<LittleEndian>(&mut raw)?;
            data.iter_mut().zip(raw).for_each(|(v, bits)| *v = half::f16::from_bits(bits).to_f32());
        }
        other => anyhow::bail!("Tensor '{}' has element type {other}, expected f32 or f16", header.name),
    }
    Ok(data)
}
