//! EXIF orientation lookup and the geometric transform each code implies.

/// Errors raised while reading orientation metadata.
///
/// These never fail a request: callers fall back to the identity transform.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata truncated at offset {0}")]
    Truncated(usize),

    #[error("Invalid JPEG marker at offset {0}")]
    BadMarker(usize),

    #[error("Unknown TIFF byte order")]
    BadByteOrder,

    #[error("Invalid TIFF magic number {0}")]
    BadMagic(u16),

    #[error("Unsupported orientation value type {0}")]
    UnsupportedType(u16),
}

const TAG_ORIENTATION: u16 = 0x0112;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// Orientation tag of a JPEG, if it carries one.
///
/// Non-JPEG input and JPEGs without an EXIF block yield `Ok(None)`.
pub fn read_orientation(bytes: &[u8]) -> Result<Option<u16>, MetadataError> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return Ok(None);
    }

    let mut pos = 2;
    loop {
        if bytes.get(pos) != Some(&0xFF) {
            return Err(MetadataError::BadMarker(pos));
        }
        // Markers may be preceded by any number of fill bytes
        while bytes.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        let marker = *bytes.get(pos + 1).ok_or(MetadataError::Truncated(pos + 1))?;

        match marker {
            // Start of scan or end of image: no metadata past this point
            0xDA | 0xD9 => return Ok(None),
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }

        let length = read_u16(bytes, pos + 2, ByteOrder::Big)? as usize;
        if length < 2 {
            return Err(MetadataError::Truncated(pos + 2));
        }
        let start = pos + 4;
        let end = pos + 2 + length;
        let segment = bytes.get(start..end).ok_or(MetadataError::Truncated(end))?;

        if marker == 0xE1 {
            if let Some(tiff) = segment.strip_prefix(EXIF_HEADER) {
                return orientation_from_tiff(tiff);
            }
        }

        pos = end;
    }
}

#[derive(Debug, Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

fn read_u16(bytes: &[u8], at: usize, order: ByteOrder) -> Result<u16, MetadataError> {
    let raw: [u8; 2] = bytes
        .get(at..at + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or(MetadataError::Truncated(at))?;
    Ok(match order {
        ByteOrder::Little => u16::from_le_bytes(raw),
        ByteOrder::Big => u16::from_be_bytes(raw),
    })
}

fn read_u32(bytes: &[u8], at: usize, order: ByteOrder) -> Result<u32, MetadataError> {
    let raw: [u8; 4] = bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(MetadataError::Truncated(at))?;
    Ok(match order {
        ByteOrder::Little => u32::from_le_bytes(raw),
        ByteOrder::Big => u32::from_be_bytes(raw),
    })
}

/// Look up the orientation tag in IFD0 of a TIFF structure.
fn orientation_from_tiff(tiff: &[u8]) -> Result<Option<u16>, MetadataError> {
    let order = match tiff.get(0..2) {
        Some(b"II") => ByteOrder::Little,
        Some(b"MM") => ByteOrder::Big,
        _ => return Err(MetadataError::BadByteOrder),
    };

    let magic = read_u16(tiff, 2, order)?;
    if magic != 42 {
        return Err(MetadataError::BadMagic(magic));
    }

    let ifd = read_u32(tiff, 4, order)? as usize;
    let count = read_u16(tiff, ifd, order)? as usize;

    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        if read_u16(tiff, entry, order)? != TAG_ORIENTATION {
            continue;
        }

        let value = match read_u16(tiff, entry + 2, order)? {
            TYPE_SHORT => read_u16(tiff, entry + 8, order)?,
            TYPE_LONG => read_u32(tiff, entry + 8, order)? as u16,
            other => return Err(MetadataError::UnsupportedType(other)),
        };
        return Ok(Some(value));
    }

    Ok(None)
}

/// The eight EXIF orientations, named by the correction they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// 1 (and 0 / unknown)
    Identity,
    /// 2
    FlipHorizontal,
    /// 3
    Rotate180,
    /// 4
    FlipVertical,
    /// 5: mirror across the main diagonal
    Transpose,
    /// 6: rotate 90° clockwise
    Rotate90,
    /// 7: mirror across the anti-diagonal
    Transverse,
    /// 8: rotate 270° clockwise
    Rotate270,
}

impl Orientation {
    /// Map an EXIF tag value; anything outside 2..=8 is the identity.
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::Transverse,
            8 => Self::Rotate270,
            _ => Self::Identity,
        }
    }

    /// Whether the corrected image has width and height swapped.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270
        )
    }

    /// Forward transform for a `width` x `height` source.
    ///
    /// Translations move the rotated/mirrored bounding box back to the origin.
    pub fn transform(&self, width: u32, height: u32) -> Affine {
        let w = f64::from(width);
        let h = f64::from(height);
        match self {
            Self::Identity => Affine::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            Self::FlipHorizontal => Affine::new(-1.0, 0.0, 0.0, 1.0, w, 0.0),
            Self::Rotate180 => Affine::new(-1.0, 0.0, 0.0, -1.0, w, h),
            Self::FlipVertical => Affine::new(1.0, 0.0, 0.0, -1.0, 0.0, h),
            Self::Transpose => Affine::new(0.0, 1.0, 1.0, 0.0, 0.0, 0.0),
            Self::Rotate90 => Affine::new(0.0, -1.0, 1.0, 0.0, h, 0.0),
            Self::Transverse => Affine::new(0.0, -1.0, -1.0, 0.0, h, w),
            Self::Rotate270 => Affine::new(0.0, 1.0, -1.0, 0.0, 0.0, w),
        }
    }
}

/// 2D affine map `(x, y) -> (a*x + b*y + tx, c*x + d*y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    tx: f64,
    ty: f64,
}

impl Affine {
    pub fn new(a: f64, b: f64, c: f64, d: f64, tx: f64, ty: f64) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    /// Inverse map, or `None` for a degenerate matrix.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.d - self.b * self.c;
        if det == 0.0 {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Self {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + b * self.ty),
            ty: -(c * self.tx + d * self.ty),
        })
    }
}
