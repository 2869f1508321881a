//! Encoder for the motion format.
//!
//! Tracks are flattened back into the file's flat record streams. Within
//! each section the records are emitted globally sorted by frame, so the
//! written frame sequence is non-decreasing even when keyframes come from
//! many tracks.

use crate::motion::{BoneKeyframe, MorphKeyframe, MotionDocument};
use crate::parsers::TextCodec;
use crate::writers::Writer;

pub fn encode_motion(doc: &MotionDocument) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_fixed_text("Vocaloid Motion Data 0002", 30, TextCodec::ShiftJis);
    w.put_fixed_text(&doc.model_name, 20, TextCodec::ShiftJis);

    let mut bone_records: Vec<(&str, &BoneKeyframe)> = doc
        .bone_tracks
        .iter()
        .flat_map(|(name, track)| track.iter().map(move |key| (name.as_str(), key)))
        .collect();
    bone_records.sort_by_key(|(_, key)| key.frame);
    w.put_u32(bone_records.len() as u32);
    for (name, key) in bone_records {
        w.put_fixed_text(name, 15, TextCodec::ShiftJis);
        w.put_u32(key.frame);
        w.put_vec3(key.translation);
        w.put_vec4(key.rotation);
        w.put_bytes(&key.interpolation);
    }

    let mut morph_records: Vec<(&str, &MorphKeyframe)> = doc
        .morph_tracks
        .iter()
        .flat_map(|(name, track)| track.iter().map(move |key| (name.as_str(), key)))
        .collect();
    morph_records.sort_by_key(|(_, key)| key.frame);
    w.put_u32(morph_records.len() as u32);
    for (name, key) in morph_records {
        w.put_fixed_text(name, 15, TextCodec::ShiftJis);
        w.put_u32(key.frame);
        w.put_f32(key.weight);
    }

    let mut camera = doc.camera_track.clone();
    camera.sort_by_key(|key| key.frame);
    w.put_u32(camera.len() as u32);
    for key in &camera {
        w.put_u32(key.frame);
        w.put_f32(key.distance);
        w.put_vec3(key.position);
        w.put_vec3(key.rotation);
        w.put_bytes(&key.interpolation);
        w.put_u32(key.fov);
        w.put_u8(u8::from(!key.perspective));
    }

    let mut lamp = doc.lamp_track.clone();
    lamp.sort_by_key(|key| key.frame);
    w.put_u32(lamp.len() as u32);
    for key in &lamp {
        w.put_u32(key.frame);
        w.put_vec3(key.color);
        w.put_vec3(key.direction);
    }

    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bone_records_are_emitted_frame_sorted() {
        let mut doc = MotionDocument::new("m");
        doc.bone_tracks
            .insert("a".into(), vec![BoneKeyframe::new(0), BoneKeyframe::new(8)]);
        doc.bone_tracks
            .insert("b".into(), vec![BoneKeyframe::new(3)]);
        let bytes = encode_motion(&doc);

        // Walk the bone section and collect the frame numbers in file order.
        let count = u32::from_le_bytes(bytes[50..54].try_into().unwrap());
        assert_eq!(count, 3);
        let mut frames = Vec::new();
        let mut at = 54;
        for _ in 0..count {
            frames.push(u32::from_le_bytes(bytes[at + 15..at + 19].try_into().unwrap()));
            at += 111;
        }
        assert_eq!(frames, [0, 3, 8]);
    }

    #[test]
    fn empty_document_still_writes_all_sections() {
        let bytes = encode_motion(&MotionDocument::new(""));
        // Header plus four zero counts.
        assert_eq!(bytes.len(), 30 + 20 + 4 * 4);
    }
}
