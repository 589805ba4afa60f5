//! H.264 Annex B bitstream utilities.
//!
//! The depacketizer hands us Annex B access units. We only look inside them
//! to flag IDR frames and to recover the coded picture size from the SPS,
//! which the transport never reports.

/// Check if an Annex B H.264 access unit contains an IDR slice (NAL type 5).
pub fn h264_contains_idr(data: &[u8]) -> bool {
    extract_nals(data).iter().any(|(nal_type, _)| *nal_type == 5)
}

/// Extract NAL units from an Annex B byte stream.
/// Returns a Vec of (nal_type, payload_bytes) tuples.
pub fn extract_nals(data: &[u8]) -> Vec<(u8, &[u8])> {
    let mut nal_starts = Vec::new();

    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                nal_starts.push((i, i + 4));
                i += 4;
                continue;
            } else if data[i + 2] == 1 {
                nal_starts.push((i, i + 3));
                i += 3;
                continue;
            }
        }
        i += 1;
    }

    let mut nals = Vec::with_capacity(nal_starts.len());
    for (idx, &(_, start)) in nal_starts.iter().enumerate() {
        if start >= data.len() {
            continue;
        }
        let end = nal_starts
            .get(idx + 1)
            .map(|&(code_start, _)| code_start)
            .unwrap_or(data.len());
        if end <= start {
            continue;
        }
        nals.push((data[start] & 0x1F, &data[start..end]));
    }
    nals
}

/// Strip emulation-prevention bytes (the 0x03 in 00 00 03).
pub fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &byte in nal {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    /// Display width after cropping
    pub width: u32,
    /// Display height after cropping
    pub height: u32,
}

/// Exp-Golomb bit reader for H.264 SPS parsing.
struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    fn read_bit(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.byte_offset)?;
        let bit = (byte >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
        Some(bit)
    }

    fn read_flag(&mut self) -> Option<bool> {
        Some(self.read_bit()? == 1)
    }

    fn read_bits(&mut self, n: u8) -> Option<u32> {
        let mut val = 0u32;
        for _ in 0..n {
            val = (val << 1) | self.read_bit()? as u32;
        }
        Some(val)
    }

    /// Read unsigned Exp-Golomb coded value.
    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        if leading_zeros == 0 {
            return Some(0);
        }
        let suffix = self.read_bits(leading_zeros as u8)?;
        Some((1 << leading_zeros) - 1 + suffix)
    }

    /// Read signed Exp-Golomb coded value.
    fn read_se(&mut self) -> Option<i32> {
        let val = self.read_ue()?;
        if val % 2 == 1 {
            Some((val / 2 + 1) as i32)
        } else {
            Some(-((val / 2) as i32))
        }
    }

    fn skip_scaling_list(&mut self, size: usize) -> Option<()> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;
        for _ in 0..size {
            if next_scale != 0 {
                let delta = self.read_se()?;
                next_scale = (last_scale + delta + 256) % 256;
            }
            if next_scale != 0 {
                last_scale = next_scale;
            }
        }
        Some(())
    }
}

const HIGH_PROFILES: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

/// Parse an SPS NAL unit (including the NAL header byte, still escaped).
pub fn parse_sps(nal_data: &[u8]) -> Option<SpsInfo> {
    if nal_data.len() < 4 || nal_data[0] & 0x1F != 7 {
        return None;
    }
    let rbsp = unescape_rbsp(nal_data);
    if rbsp.len() < 4 {
        return None;
    }

    let profile_idc = rbsp[1];
    let level_idc = rbsp[3];
    let mut reader = BitReader::new(&rbsp[4..]);

    // seq_parameter_set_id
    reader.read_ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = reader.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = reader.read_flag()?;
        }
        reader.read_ue()?; // bit_depth_luma_minus8
        reader.read_ue()?; // bit_depth_chroma_minus8
        reader.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if reader.read_flag()? {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if reader.read_flag()? {
                    reader.skip_scaling_list(if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    reader.read_ue()?; // log2_max_frame_num_minus4
    match reader.read_ue()? {
        0 => {
            reader.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            reader.read_bit()?; // delta_pic_order_always_zero_flag
            reader.read_se()?; // offset_for_non_ref_pic
            reader.read_se()?; // offset_for_top_to_bottom_field
            for _ in 0..reader.read_ue()? {
                reader.read_se()?;
            }
        }
        _ => {}
    }

    reader.read_ue()?; // max_num_ref_frames
    reader.read_bit()?; // gaps_in_frame_num_value_allowed_flag
    let width_in_mbs = reader.read_ue()? + 1;
    let height_in_map_units = reader.read_ue()? + 1;
    let frame_mbs_only = reader.read_flag()?;
    if !frame_mbs_only {
        reader.read_bit()?; // mb_adaptive_frame_field_flag
    }
    reader.read_bit()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if reader.read_flag()? {
        crop_left = reader.read_ue()?;
        crop_right = reader.read_ue()?;
        crop_top = reader.read_ue()?;
        crop_bottom = reader.read_ue()?;
    }

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let (crop_unit_x, crop_unit_y) = if separate_colour_plane || chroma_format_idc == 0 {
        (1, field_factor)
    } else {
        let sub_width_c = if chroma_format_idc == 3 { 1 } else { 2 };
        let sub_height_c = if chroma_format_idc == 1 { 2 } else { 1 };
        (sub_width_c, sub_height_c * field_factor)
    };

    let width = (width_in_mbs * 16).checked_sub(crop_unit_x * (crop_left + crop_right))?;
    let height = (field_factor * height_in_map_units * 16)
        .checked_sub(crop_unit_y * (crop_top + crop_bottom))?;

    Some(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

/// Picture size from the first SPS in an access unit, if any.
pub fn access_unit_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    extract_nals(data)
        .into_iter()
        .filter(|(nal_type, _)| *nal_type == 7)
        .find_map(|(_, nal)| parse_sps(nal))
        .map(|sps| (sps.width, sps.height))
        .filter(|&(w, h)| w > 0 && h > 0)
}
