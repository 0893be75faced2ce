//! JPEG encoding with an embedded EXIF APP1 segment.
//!
//! The EXIF block is built by hand as a little-endian TIFF structure with
//! three IFDs: IFD0 (camera identity, timestamps, description), the Exif
//! sub-IFD (exposure, ISO, aperture, focal length, flash) and a GPS IFD
//! whose latitude/longitude/altitude fields are repurposed to carry the
//! machine X/Y/Z coordinates for downstream reconstruction tools.

use scan_core::error::{ScanResult, ScannerError};
use scan_core::position::Position4D;

// TIFF field types
const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

// IFD0 tags
const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;
const TAG_MAKE: u16 = 0x010F;
const TAG_MODEL: u16 = 0x0110;
const TAG_SOFTWARE: u16 = 0x0131;
const TAG_DATETIME: u16 = 0x0132;
const TAG_ARTIST: u16 = 0x013B;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;

// Exif sub-IFD tags
const TAG_EXPOSURE_TIME: u16 = 0x829A;
const TAG_F_NUMBER: u16 = 0x829D;
const TAG_ISO: u16 = 0x8827;
const TAG_DATETIME_ORIGINAL: u16 = 0x9003;
const TAG_FLASH: u16 = 0x9209;
const TAG_FOCAL_LENGTH: u16 = 0x920A;

// GPS IFD tags
const TAG_GPS_LAT_REF: u16 = 0x0001;
const TAG_GPS_LAT: u16 = 0x0002;
const TAG_GPS_LON_REF: u16 = 0x0003;
const TAG_GPS_LON: u16 = 0x0004;
const TAG_GPS_ALT: u16 = 0x0006;

/// Everything the EXIF block carries for one captured frame.
#[derive(Debug, Clone)]
pub struct ExifInfo {
    pub make: String,
    pub model: String,
    pub software: String,
    /// Human-readable scan point and coordinates.
    pub description: String,
    pub artist: String,
    /// `YYYY:MM:DD HH:MM:SS`, EXIF's datetime format.
    pub datetime: String,
    pub exposure_us: u32,
    pub iso: u32,
    /// F-number as a rational, e.g. (18, 10) for f/1.8.
    pub f_number: (u32, u32),
    /// Focal length in mm as a rational, e.g. (27, 10) for 2.7 mm.
    pub focal_length: (u32, u32),
    pub flash_fired: bool,
    /// Machine position carried in the GPS fields.
    pub position: Position4D,
}

impl ExifInfo {
    /// Exposure as an EXIF rational: whole seconds, or `1/n`.
    fn exposure_rational(&self) -> (u32, u32) {
        if self.exposure_us == 0 {
            return (0, 1);
        }
        if self.exposure_us >= 1_000_000 {
            (self.exposure_us / 1_000_000, 1)
        } else {
            (1, (1_000_000.0 / self.exposure_us as f64).round() as u32)
        }
    }
}

/// One IFD entry before layout.
struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Raw value bytes; inlined when <= 4 bytes, stored in the value area
    /// otherwise.
    data: Vec<u8>,
}

fn ascii_entry(tag: u16, text: &str) -> Entry {
    let mut data = text.as_bytes().to_vec();
    data.push(0);
    Entry {
        tag,
        field_type: TYPE_ASCII,
        count: data.len() as u32,
        data,
    }
}

fn short_entry(tag: u16, value: u16) -> Entry {
    Entry {
        tag,
        field_type: TYPE_SHORT,
        count: 1,
        data: value.to_le_bytes().to_vec(),
    }
}

fn long_entry(tag: u16, value: u32) -> Entry {
    Entry {
        tag,
        field_type: TYPE_LONG,
        count: 1,
        data: value.to_le_bytes().to_vec(),
    }
}

fn rational_entry(tag: u16, rationals: &[(u32, u32)]) -> Entry {
    let mut data = Vec::with_capacity(rationals.len() * 8);
    for &(num, den) in rationals {
        data.extend_from_slice(&num.to_le_bytes());
        data.extend_from_slice(&den.to_le_bytes());
    }
    Entry {
        tag,
        field_type: TYPE_RATIONAL,
        count: rationals.len() as u32,
        data,
    }
}

/// Serialized size of an IFD table (count word + entries + next pointer).
fn ifd_table_len(entries: usize) -> u32 {
    2 + entries as u32 * 12 + 4
}

/// Serialize one IFD at `ifd_offset` (from the TIFF header), placing
/// oversized values immediately after the table.
fn build_ifd(mut entries: Vec<Entry>, ifd_offset: u32) -> Vec<u8> {
    entries.sort_by_key(|e| e.tag);

    let mut table = Vec::new();
    let mut values = Vec::new();
    let value_base = ifd_offset + ifd_table_len(entries.len());

    table.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in &entries {
        table.extend_from_slice(&entry.tag.to_le_bytes());
        table.extend_from_slice(&entry.field_type.to_le_bytes());
        table.extend_from_slice(&entry.count.to_le_bytes());
        if entry.data.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.data.len()].copy_from_slice(&entry.data);
            table.extend_from_slice(&inline);
        } else {
            let offset = value_base + values.len() as u32;
            table.extend_from_slice(&offset.to_le_bytes());
            values.extend_from_slice(&entry.data);
            if values.len() % 2 == 1 {
                values.push(0); // word alignment
            }
        }
    }
    table.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
    table.extend_from_slice(&values);
    table
}

/// Total serialized length of an IFD including its value area.
fn ifd_total_len(entries: &[Entry]) -> u32 {
    let mut values = 0u32;
    for entry in entries {
        if entry.data.len() > 4 {
            values += entry.data.len() as u32;
            if entry.data.len() % 2 == 1 {
                values += 1;
            }
        }
    }
    ifd_table_len(entries.len()) + values
}

/// Machine coordinate encoded as degree/minute/second rationals, the same
/// creative reuse the GPS spec's sexagesimal format allows.
fn coordinate_rationals(value: f64) -> [(u32, u32); 3] {
    let value = value.abs();
    let degrees = value.floor();
    let minutes_f = (value - degrees) * 60.0;
    let minutes = minutes_f.floor();
    let seconds_md = ((minutes_f - minutes) * 60.0 * 1000.0).round();
    [
        (degrees as u32, 1),
        (minutes as u32, 1),
        (seconds_md as u32, 1000),
    ]
}

/// Build the complete APP1 segment (marker through payload).
pub fn build_app1(info: &ExifInfo) -> Vec<u8> {
    let ifd0_entries_builder = |exif_offset: u32, gps_offset: u32| -> Vec<Entry> {
        vec![
            ascii_entry(TAG_IMAGE_DESCRIPTION, &info.description),
            ascii_entry(TAG_MAKE, &info.make),
            ascii_entry(TAG_MODEL, &info.model),
            ascii_entry(TAG_SOFTWARE, &info.software),
            ascii_entry(TAG_DATETIME, &info.datetime),
            ascii_entry(TAG_ARTIST, &info.artist),
            long_entry(TAG_EXIF_IFD, exif_offset),
            long_entry(TAG_GPS_IFD, gps_offset),
        ]
    };

    let exif_entries = vec![
        rational_entry(TAG_EXPOSURE_TIME, &[info.exposure_rational()]),
        rational_entry(TAG_F_NUMBER, &[info.f_number]),
        short_entry(TAG_ISO, info.iso.min(u16::MAX as u32) as u16),
        ascii_entry(TAG_DATETIME_ORIGINAL, &info.datetime),
        short_entry(TAG_FLASH, if info.flash_fired { 0x0001 } else { 0x0000 }),
        rational_entry(TAG_FOCAL_LENGTH, &[info.focal_length]),
    ];

    let gps_entries = vec![
        ascii_entry(TAG_GPS_LAT_REF, "N"),
        rational_entry(TAG_GPS_LAT, &coordinate_rationals(info.position.x)),
        ascii_entry(TAG_GPS_LON_REF, "E"),
        rational_entry(TAG_GPS_LON, &coordinate_rationals(info.position.y)),
        rational_entry(
            TAG_GPS_ALT,
            &[((info.position.z.abs() * 1000.0).round() as u32, 1000)],
        ),
    ];

    // Layout: header(8) | IFD0 | ExifIFD | GPS IFD
    let ifd0_offset = 8u32;
    let probe = ifd0_entries_builder(0, 0);
    let exif_offset = ifd0_offset + ifd_total_len(&probe);
    let gps_offset = exif_offset + ifd_total_len(&exif_entries);

    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"II"); // little-endian
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&ifd0_offset.to_le_bytes());
    tiff.extend_from_slice(&build_ifd(
        ifd0_entries_builder(exif_offset, gps_offset),
        ifd0_offset,
    ));
    tiff.extend_from_slice(&build_ifd(exif_entries, exif_offset));
    tiff.extend_from_slice(&build_ifd(gps_entries, gps_offset));

    let mut app1 = Vec::with_capacity(tiff.len() + 10);
    app1.extend_from_slice(&[0xFF, 0xE1]);
    let payload_len = (tiff.len() + 6 + 2) as u16; // Exif\0\0 + length word
    app1.extend_from_slice(&payload_len.to_be_bytes());
    app1.extend_from_slice(b"Exif\0\0");
    app1.extend_from_slice(&tiff);
    app1
}

/// Encode RGB8 pixels to JPEG at the given quality.
pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> ScanResult<Vec<u8>> {
    let expected = width as usize * height as usize * 3;
    if pixels.len() != expected {
        return Err(ScannerError::storage(format!(
            "pixel buffer is {} bytes, expected {} for {}x{} RGB8",
            pixels.len(),
            expected,
            width,
            height
        )));
    }
    let mut out = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(pixels, width, height, image::ExtendedColorType::Rgb8)
        .map_err(|e| ScannerError::storage(format!("JPEG encode failed: {}", e)))?;
    Ok(out)
}

/// Insert an APP1 segment directly after the JPEG SOI marker.
pub fn embed_app1(jpeg: &[u8], app1: &[u8]) -> ScanResult<Vec<u8>> {
    if jpeg.len() < 2 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return Err(ScannerError::storage("not a JPEG: missing SOI marker"));
    }
    let mut out = Vec::with_capacity(jpeg.len() + app1.len());
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(app1);
    out.extend_from_slice(&jpeg[2..]);
    Ok(out)
}

/// Encode pixels and embed the EXIF block in one step.
pub fn encode_with_exif(
    pixels: &[u8],
    width: u32,
    height: u32,
    quality: u8,
    info: &ExifInfo,
) -> ScanResult<Vec<u8>> {
    let jpeg = encode_jpeg(pixels, width, height, quality)?;
    embed_app1(&jpeg, &build_app1(info))
}
