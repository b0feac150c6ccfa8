//! Typed accessor contents and numeric dispatch by component type

use crate::document::ComponentType;
use crate::error::{GltfError, Result};

/// A numeric type that can be stored as an accessor component
pub trait Component: bytemuck::Pod + PartialOrd + Send + Sync + 'static {
    const COMPONENT_TYPE: ComponentType;

    fn to_f64(self) -> f64;

    /// Numeric cast; out-of-range values saturate
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_component {
    ($ty:ty, $variant:ident) => {
        impl Component for $ty {
            const COMPONENT_TYPE: ComponentType = ComponentType::$variant;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }
        }
    };
}

impl_component!(i8, I8);
impl_component!(u8, U8);
impl_component!(i16, I16);
impl_component!(u16, U16);
impl_component!(u32, U32);
impl_component!(f32, F32);

/// Read `count` elements of `components` values each from `bytes`.
///
/// `stride` is the distance between element starts; `None` means tightly packed.
pub fn read_elements<T: Component>(
    bytes: &[u8],
    count: usize,
    components: usize,
    stride: Option<usize>,
) -> Result<Vec<T>> {
    let size = std::mem::size_of::<T>();
    let element_size = size * components;
    let stride = stride.unwrap_or(element_size);
    if stride < element_size {
        return Err(GltfError::format(format!(
            "byteStride {stride} is smaller than the element size {element_size}"
        )));
    }

    if count == 0 {
        return Ok(Vec::new());
    }
    let required = (count - 1)
        .checked_mul(stride)
        .and_then(|extent| extent.checked_add(element_size))
        .ok_or_else(|| {
            GltfError::format(format!(
                "{count} elements with byteStride {stride} overflow the address space"
            ))
        })?;
    if bytes.len() < required {
        return Err(GltfError::format(format!(
            "accessor needs {required} bytes but only {} are available",
            bytes.len()
        )));
    }

    let mut values = Vec::with_capacity(count * components);
    for element in 0..count {
        let start = element * stride;
        for component in 0..components {
            let offset = start + component * size;
            values.push(bytemuck::pod_read_unaligned(&bytes[offset..offset + size]));
        }
    }
    Ok(values)
}

/// Per-component bounds of interleaved `values`
pub fn compute_min_max<T: Component>(values: &[T], components: usize) -> (Vec<f64>, Vec<f64>) {
    let mut min = vec![f64::INFINITY; components];
    let mut max = vec![f64::NEG_INFINITY; components];

    for element in values.chunks_exact(components) {
        for (i, value) in element.iter().enumerate() {
            let value = value.to_f64();
            min[i] = min[i].min(value);
            max[i] = max[i].max(value);
        }
    }

    (min, max)
}

/// Accessor contents decoded at their declared numeric width
#[derive(Debug, Clone, PartialEq)]
pub enum AccessorData {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

macro_rules! dispatch {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            AccessorData::I8($values) => $body,
            AccessorData::U8($values) => $body,
            AccessorData::I16($values) => $body,
            AccessorData::U16($values) => $body,
            AccessorData::U32($values) => $body,
            AccessorData::F32($values) => $body,
        }
    };
}

fn cast_all<T: Component, U: Component>(values: &[T]) -> Vec<U> {
    values.iter().map(|v| U::from_f64(v.to_f64())).collect()
}

impl AccessorData {
    /// Decode elements from raw bytes, dispatching on `component_type`
    pub fn read(
        component_type: ComponentType,
        bytes: &[u8],
        count: usize,
        components: usize,
        stride: Option<usize>,
    ) -> Result<Self> {
        Ok(match component_type {
            ComponentType::I8 => Self::I8(read_elements(bytes, count, components, stride)?),
            ComponentType::U8 => Self::U8(read_elements(bytes, count, components, stride)?),
            ComponentType::I16 => Self::I16(read_elements(bytes, count, components, stride)?),
            ComponentType::U16 => Self::U16(read_elements(bytes, count, components, stride)?),
            ComponentType::U32 => Self::U32(read_elements(bytes, count, components, stride)?),
            ComponentType::F32 => Self::F32(read_elements(bytes, count, components, stride)?),
        })
    }

    /// All-zero contents of the given width
    pub fn zeroed(component_type: ComponentType, len: usize) -> Self {
        match component_type {
            ComponentType::I8 => Self::I8(vec![0; len]),
            ComponentType::U8 => Self::U8(vec![0; len]),
            ComponentType::I16 => Self::I16(vec![0; len]),
            ComponentType::U16 => Self::U16(vec![0; len]),
            ComponentType::U32 => Self::U32(vec![0; len]),
            ComponentType::F32 => Self::F32(vec![0.0; len]),
        }
    }

    pub fn component_type(&self) -> ComponentType {
        match self {
            Self::I8(_) => ComponentType::I8,
            Self::U8(_) => ComponentType::U8,
            Self::I16(_) => ComponentType::I16,
            Self::U16(_) => ComponentType::U16,
            Self::U32(_) => ComponentType::U32,
            Self::F32(_) => ComponentType::F32,
        }
    }

    /// Number of components (not elements)
    pub fn len(&self) -> usize {
        dispatch!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian bytes of the contents
    pub fn as_bytes(&self) -> &[u8] {
        dispatch!(self, values => bytemuck::cast_slice(values.as_slice()))
    }

    pub fn min_max(&self, components: usize) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, values => compute_min_max(values.as_slice(), components))
    }

    /// Component `index` as a float, used for sparse index lists
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        dispatch!(self, values => values.get(index).map(|v| v.to_f64()))
    }

    /// Overwrite element `element` with element `source_element` of `source`
    pub fn copy_element_from(
        &mut self,
        element: usize,
        source: &AccessorData,
        source_element: usize,
        components: usize,
    ) -> Result<()> {
        match (self, source) {
            (Self::I8(dst), Self::I8(src)) => copy_element(dst, src, element, source_element, components),
            (Self::U8(dst), Self::U8(src)) => copy_element(dst, src, element, source_element, components),
            (Self::I16(dst), Self::I16(src)) => copy_element(dst, src, element, source_element, components),
            (Self::U16(dst), Self::U16(src)) => copy_element(dst, src, element, source_element, components),
            (Self::U32(dst), Self::U32(src)) => copy_element(dst, src, element, source_element, components),
            (Self::F32(dst), Self::F32(src)) => copy_element(dst, src, element, source_element, components),
            _ => Err(GltfError::format("sparse values do not match the accessor component type")),
        }
    }

    /// Numerically cast the contents to another component type
    pub fn convert(&self, to: ComponentType) -> Self {
        if to == self.component_type() {
            return self.clone();
        }
        dispatch!(self, values => match to {
            ComponentType::I8 => Self::I8(cast_all(values.as_slice())),
            ComponentType::U8 => Self::U8(cast_all(values.as_slice())),
            ComponentType::I16 => Self::I16(cast_all(values.as_slice())),
            ComponentType::U16 => Self::U16(cast_all(values.as_slice())),
            ComponentType::U32 => Self::U32(cast_all(values.as_slice())),
            ComponentType::F32 => Self::F32(cast_all(values.as_slice())),
        })
    }
}

fn copy_element<T: Copy>(
    dst: &mut [T],
    src: &[T],
    element: usize,
    source_element: usize,
    components: usize,
) -> Result<()> {
    let to = element * components;
    let from = source_element * components;
    if to + components > dst.len() || from + components > src.len() {
        return Err(GltfError::format(format!(
            "sparse element {element} is out of range"
        )));
    }
    dst[to..to + components].copy_from_slice(&src[from..from + components]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_min_max_vec3() {
        let values = [0.0f32, 0.0, 0.0, 1.0, 2.0, 3.0, -1.0, -2.0, -3.0];
        let (min, max) = compute_min_max(&values, 3);
        assert_eq!(min, vec![-1.0, -2.0, -3.0]);
        assert_eq!(max, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_read_packed_u16() {
        let bytes: Vec<u8> = [1u16, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let values: Vec<u16> = read_elements(&bytes, 3, 1, None).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_strided_elements() {
        // Two VEC2<u8> elements interleaved in 4-byte slots
        let bytes = [1u8, 2, 0xAA, 0xAA, 3, 4, 0xAA, 0xAA];
        let values: Vec<u8> = read_elements(&bytes, 2, 2, Some(4)).unwrap();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_read_short_buffer_fails() {
        let bytes = [0u8; 10];
        assert!(read_elements::<f32>(&bytes, 1, 3, None).is_err());
    }

    #[test]
    fn test_huge_stride_fails() {
        let bytes = [0u8; 16];
        assert!(matches!(
            read_elements::<f32>(&bytes, usize::MAX, 1, Some(usize::MAX / 2)),
            Err(GltfError::Format(_))
        ));
    }

    #[test]
    fn test_convert_saturates() {
        let data = AccessorData::F32(vec![-1.0, 0.5, 300.0]);
        assert_eq!(data.convert(ComponentType::U8), AccessorData::U8(vec![0, 0, 255]));
    }

    #[test]
    fn test_dispatch_by_component_type() {
        let bytes: Vec<u8> = [1i16, -2].iter().flat_map(|v| v.to_le_bytes()).collect();
        let data = AccessorData::read(ComponentType::I16, &bytes, 2, 1, None).unwrap();
        assert_eq!(data, AccessorData::I16(vec![1, -2]));
        assert_eq!(data.as_bytes(), bytes.as_slice());
        assert_eq!(data.min_max(1), (vec![-2.0], vec![1.0]));
    }
}
