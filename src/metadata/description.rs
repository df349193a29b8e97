//! Metadata schema descriptor
//!
//! An ordered list of `(name, type)` columns packed into a fixed-width row.
//! The descriptor is persisted under the `M` key when the storage is
//! created and reloaded on open; element handles are indexes into the
//! column list.

use crate::error::{Result, StorageError};
use crate::types::{Index, ScalarValue};
use serde::{Deserialize, Serialize};

/// Column type of a metadata element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaDataType {
    Int8,
    Int16,
    Int32,
    UInt8,
    UInt16,
    UInt32,
    Float16,
    Float32,
}

impl MetaDataType {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int8" => Ok(MetaDataType::Int8),
            "int16" => Ok(MetaDataType::Int16),
            "int32" => Ok(MetaDataType::Int32),
            "uint8" => Ok(MetaDataType::UInt8),
            "uint16" => Ok(MetaDataType::UInt16),
            "uint32" => Ok(MetaDataType::UInt32),
            "float16" => Ok(MetaDataType::Float16),
            "float32" => Ok(MetaDataType::Float32),
            _ => Err(StorageError::Config(format!(
                "unknown metadata element type '{}'",
                name
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MetaDataType::Int8 => "int8",
            MetaDataType::Int16 => "int16",
            MetaDataType::Int32 => "int32",
            MetaDataType::UInt8 => "uint8",
            MetaDataType::UInt16 => "uint16",
            MetaDataType::UInt32 => "uint32",
            MetaDataType::Float16 => "float16",
            MetaDataType::Float32 => "float32",
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            MetaDataType::Int8 | MetaDataType::UInt8 => 1,
            MetaDataType::Int16 | MetaDataType::UInt16 | MetaDataType::Float16 => 2,
            MetaDataType::Int32 | MetaDataType::UInt32 | MetaDataType::Float32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, MetaDataType::Float16 | MetaDataType::Float32)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            MetaDataType::Int8 | MetaDataType::Int16 | MetaDataType::Int32
        )
    }
}

/// One column: name, type and byte offset inside the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaDataElement {
    pub name: String,
    pub mtype: MetaDataType,
    pub offset: usize,
}

/// The schema: ordered columns with computed offsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaDataDescription {
    elements: Vec<MetaDataElement>,
    bytesize: usize,
}

impl MetaDataDescription {
    /// Parse a `name:type` comma list, e.g. `doclen:uint16,date:uint32`.
    pub fn parse(source: &str) -> Result<Self> {
        let mut descr = MetaDataDescription::default();
        for item in source.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (name, tname) = item.split_once(':').ok_or_else(|| {
                StorageError::Config(format!(
                    "':' expected between name and type in metadata element '{}'",
                    item
                ))
            })?;
            descr.add(name.trim(), MetaDataType::parse(tname.trim())?)?;
        }
        Ok(descr)
    }

    pub fn add(&mut self, name: &str, mtype: MetaDataType) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::Config("empty metadata element name".into()));
        }
        if self.has_element(name) {
            return Err(StorageError::Config(format!(
                "duplicate metadata element '{}'",
                name
            )));
        }
        self.elements.push(MetaDataElement {
            name: name.to_ascii_lowercase(),
            mtype,
            offset: self.bytesize,
        });
        self.bytesize += mtype.byte_size();
        Ok(())
    }

    /// Width of one row in bytes.
    pub fn bytesize(&self) -> usize {
        self.bytesize
    }

    pub fn nof_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn has_element(&self, name: &str) -> bool {
        let lo = name.to_ascii_lowercase();
        self.elements.iter().any(|e| e.name == lo)
    }

    /// Handle (column index) of `name`.
    pub fn element_handle(&self, name: &str) -> Result<Index> {
        let lo = name.to_ascii_lowercase();
        self.elements
            .iter()
            .position(|e| e.name == lo)
            .map(|p| p as Index)
            .ok_or_else(|| {
                StorageError::NotFound(format!("metadata element '{}' not defined", name))
            })
    }

    pub fn element(&self, handle: Index) -> Result<&MetaDataElement> {
        self.elements.get(handle as usize).ok_or_else(|| {
            StorageError::CorruptData("metadata element handle out of bounds".into())
        })
    }

    pub fn elements(&self) -> &[MetaDataElement] {
        &self.elements
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Half precision encode; round to nearest, ties to even.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x7F_FFFF;
    if exp == 0xFF {
        // inf / nan
        return sign | 0x7C00 | if frac != 0 { 0x200 } else { 0 };
    }
    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00;
    }
    if unbiased >= -14 {
        let mut half = ((unbiased + 15) as u32) << 10 | (frac >> 13);
        // round
        if frac & 0x1FFF > 0x1000 || (frac & 0x1FFF == 0x1000 && half & 1 == 1) {
            half += 1;
        }
        return sign | half as u16;
    }
    if unbiased >= -24 {
        // subnormal half
        let shift = (-1 - unbiased) as u32;
        let mant = (frac | 0x80_0000) >> shift;
        let rem = (frac | 0x80_0000) & ((1 << shift) - 1);
        let mut half = mant;
        if rem > (1 << (shift - 1)) || (rem == (1 << (shift - 1)) && half & 1 == 1) {
            half += 1;
        }
        return sign | half as u16;
    }
    sign
}

/// Half precision decode.
pub fn f16_bits_to_f32(half: u16) -> f32 {
    let sign = ((half & 0x8000) as u32) << 16;
    let exp = ((half >> 10) & 0x1F) as u32;
    let frac = (half & 0x3FF) as u32;
    let bits = if exp == 0 {
        if frac == 0 {
            sign
        } else {
            // normalize the subnormal
            let mut e: u32 = 127 - 15 + 1;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((f & 0x3FF) << 13)
        }
    } else if exp == 0x1F {
        sign | 0x7F80_0000 | (frac << 13)
    } else {
        sign | ((exp + 127 - 15) << 23) | (frac << 13)
    };
    f32::from_bits(bits)
}

/// Read one column value from a row.
pub fn read_element(row: &[u8], elem: &MetaDataElement) -> ScalarValue {
    let at = elem.offset;
    match elem.mtype {
        MetaDataType::Int8 => ScalarValue::Int(row[at] as i8 as i64),
        MetaDataType::Int16 => {
            ScalarValue::Int(i16::from_le_bytes(row[at..at + 2].try_into().unwrap()) as i64)
        }
        MetaDataType::Int32 => {
            ScalarValue::Int(i32::from_le_bytes(row[at..at + 4].try_into().unwrap()) as i64)
        }
        MetaDataType::UInt8 => ScalarValue::UInt(row[at] as u64),
        MetaDataType::UInt16 => {
            ScalarValue::UInt(u16::from_le_bytes(row[at..at + 2].try_into().unwrap()) as u64)
        }
        MetaDataType::UInt32 => {
            ScalarValue::UInt(u32::from_le_bytes(row[at..at + 4].try_into().unwrap()) as u64)
        }
        MetaDataType::Float16 => ScalarValue::Float(f16_bits_to_f32(u16::from_le_bytes(
            row[at..at + 2].try_into().unwrap(),
        )) as f64),
        MetaDataType::Float32 => ScalarValue::Float(f32::from_le_bytes(
            row[at..at + 4].try_into().unwrap(),
        ) as f64),
    }
}

/// Write one column value into a row, converting to the column type.
pub fn write_element(row: &mut [u8], elem: &MetaDataElement, value: &ScalarValue) {
    let at = elem.offset;
    match elem.mtype {
        MetaDataType::Int8 => row[at] = (value.to_int().clamp(i8::MIN as i64, i8::MAX as i64)) as u8,
        MetaDataType::Int16 => row[at..at + 2].copy_from_slice(
            &(value.to_int().clamp(i16::MIN as i64, i16::MAX as i64) as i16).to_le_bytes(),
        ),
        MetaDataType::Int32 => row[at..at + 4].copy_from_slice(
            &(value.to_int().clamp(i32::MIN as i64, i32::MAX as i64) as i32).to_le_bytes(),
        ),
        MetaDataType::UInt8 => row[at] = value.to_uint().min(u8::MAX as u64) as u8,
        MetaDataType::UInt16 => row[at..at + 2]
            .copy_from_slice(&(value.to_uint().min(u16::MAX as u64) as u16).to_le_bytes()),
        MetaDataType::UInt32 => row[at..at + 4]
            .copy_from_slice(&(value.to_uint().min(u32::MAX as u64) as u32).to_le_bytes()),
        MetaDataType::Float16 => row[at..at + 2]
            .copy_from_slice(&f32_to_f16_bits(value.to_float() as f32).to_le_bytes()),
        MetaDataType::Float32 => {
            row[at..at + 4].copy_from_slice(&(value.to_float() as f32).to_le_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_schema() {
        let d = MetaDataDescription::parse("doclen:uint16,date:UInt32,weight:float16").unwrap();
        assert_eq!(d.nof_elements(), 3);
        assert_eq!(d.bytesize(), 8);
        assert_eq!(d.element_handle("DocLen").unwrap(), 0);
        assert_eq!(d.element(2).unwrap().offset, 4);
        assert!(d.element_handle("missing").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(MetaDataDescription::parse("doclen=uint16").is_err());
        assert!(MetaDataDescription::parse("doclen:uint64").is_err());
        assert!(MetaDataDescription::parse("a:int8,a:int8").is_err());
    }

    #[test]
    fn descriptor_round_trip() {
        let d = MetaDataDescription::parse("a:int8,b:float32").unwrap();
        let bytes = d.serialize().unwrap();
        let back = MetaDataDescription::deserialize(&bytes).unwrap();
        assert_eq!(back.nof_elements(), 2);
        assert_eq!(back.bytesize(), d.bytesize());
    }

    #[test]
    fn half_float_round_trip() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 2.5, 100.0, -0.125, 65504.0] {
            let back = f16_bits_to_f32(f32_to_f16_bits(v));
            assert_eq!(back, v, "value {}", v);
        }
        // values beyond half range saturate to infinity
        assert!(f16_bits_to_f32(f32_to_f16_bits(1.0e9)).is_infinite());
        // precision loss stays within the half epsilon for unit-scale values
        let v = 0.3f32;
        let back = f16_bits_to_f32(f32_to_f16_bits(v));
        assert!((back - v).abs() < 4.887581e-4);
    }

    #[test]
    fn row_read_write() {
        let d = MetaDataDescription::parse("a:int8,b:uint16,c:float32,d:float16").unwrap();
        let mut row = vec![0u8; d.bytesize()];
        write_element(&mut row, d.element(0).unwrap(), &ScalarValue::Int(-7));
        write_element(&mut row, d.element(1).unwrap(), &ScalarValue::UInt(40000));
        write_element(&mut row, d.element(2).unwrap(), &ScalarValue::Float(2.25));
        write_element(&mut row, d.element(3).unwrap(), &ScalarValue::Float(0.5));
        assert_eq!(read_element(&row, d.element(0).unwrap()), ScalarValue::Int(-7));
        assert_eq!(
            read_element(&row, d.element(1).unwrap()),
            ScalarValue::UInt(40000)
        );
        assert_eq!(
            read_element(&row, d.element(2).unwrap()),
            ScalarValue::Float(2.25)
        );
        assert_eq!(
            read_element(&row, d.element(3).unwrap()),
            ScalarValue::Float(0.5)
        );
    }

    #[test]
    fn out_of_range_values_clamp() {
        let d = MetaDataDescription::parse("a:uint8").unwrap();
        let mut row = vec![0u8; d.bytesize()];
        write_element(&mut row, d.element(0).unwrap(), &ScalarValue::Int(-5));
        assert_eq!(read_element(&row, d.element(0).unwrap()), ScalarValue::UInt(0));
        write_element(&mut row, d.element(0).unwrap(), &ScalarValue::UInt(999));
        assert_eq!(
            read_element(&row, d.element(0).unwrap()),
            ScalarValue::UInt(255)
        );
    }
}
