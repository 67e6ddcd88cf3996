/// First hardware H.264 encoder FFmpeg was built with, if any.
pub fn find_hw_h264_encoder() -> Option<ffmpeg_next::Codec> {
    const HW_NAMES: &[&str] = &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"];

    for name in HW_NAMES {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Hardware encoders take none of the libx264 tuning options.
pub fn is_hw_encoder(name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| name.contains(suffix))
}
