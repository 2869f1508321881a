//! Encoder for the current model format.
//!
//! Only the current variant is produced; a document decoded from a legacy
//! file is promoted on the way out (version 2.0, UTF-16LE text). Index
//! widths are re-derived from the element counts rather than carried over
//! from decode, so a document edited in memory always encodes with the
//! smallest widths that fit.

use crate::document::{
    BoneTail, DisplayElement, Joint, JointKind, Material, MaterialMorphOp, ModelDocument,
    ModelVersion, Morph, MorphOffsets, MorphPanel, RigidBody, RigidBodyMode, RigidBodyShape,
    Skinning, SphereMode, Toon, Vertex,
};
use crate::error::Error;
use crate::parsers::model::IndexWidths;
use crate::parsers::{IndexWidth, TextCodec};
use crate::writers::Writer;

/// Encodes a document as a current-format model file.
///
/// The document is validated first, so the output of a successful call
/// always decodes back to an equal document.
pub fn encode_model(doc: &ModelDocument) -> Result<Vec<u8>, Error> {
    doc.validate()?;

    let codec = match doc.header.text_codec {
        // The legacy codec does not exist in the current format.
        TextCodec::ShiftJis => TextCodec::Utf16Le,
        other => other,
    };
    let uses_qdef = doc
        .vertices
        .iter()
        .any(|v| matches!(v.skinning, Skinning::Qdef { .. }));
    let version = match doc.header.version {
        ModelVersion::Pmx21 => ModelVersion::Pmx21,
        // QDEF skinning only exists in 2.1.
        _ if uses_qdef => ModelVersion::Pmx21,
        _ => ModelVersion::Pmx20,
    };
    let widths = IndexWidths {
        vertex: IndexWidth::for_count(doc.vertices.len()),
        texture: IndexWidth::for_signed_count(doc.textures.len()),
        material: IndexWidth::for_signed_count(doc.materials.len()),
        bone: IndexWidth::for_signed_count(doc.bones.len()),
        morph: IndexWidth::for_signed_count(doc.morphs.len()),
        rigid: IndexWidth::for_signed_count(doc.rigid_bodies.len()),
    };

    let enc = ModelEncoder {
        codec,
        widths,
        extra_uv: doc.header.extra_uv_count,
    };
    let mut w = Writer::new();
    enc.header(&mut w, doc, version);
    enc.body(&mut w, doc);
    Ok(w.into_bytes())
}

struct ModelEncoder {
    codec: TextCodec,
    widths: IndexWidths,
    extra_uv: u8,
}

impl ModelEncoder {
    fn header(&self, w: &mut Writer, doc: &ModelDocument, version: ModelVersion) {
        w.put_bytes(b"PMX ");
        w.put_f32(match version {
            ModelVersion::Pmx21 => 2.1,
            _ => 2.0,
        });
        w.put_u8(8);
        w.put_u8(match self.codec {
            TextCodec::Utf16Le => 0,
            _ => 1,
        });
        w.put_u8(self.extra_uv);
        for width in [
            self.widths.vertex,
            self.widths.texture,
            self.widths.material,
            self.widths.bone,
            self.widths.morph,
            self.widths.rigid,
        ] {
            w.put_u8(width.bytes_num() as u8);
        }
        w.put_text(&doc.name, self.codec);
        w.put_text(&doc.name_en, self.codec);
        w.put_text(&doc.comment, self.codec);
        w.put_text(&doc.comment_en, self.codec);
    }

    fn body(&self, w: &mut Writer, doc: &ModelDocument) {
        w.put_i32(doc.vertices.len() as i32);
        for vertex in &doc.vertices {
            self.vertex(w, vertex);
        }

        w.put_i32(doc.faces.len() as i32 * 3);
        for face in &doc.faces {
            for &v in face {
                w.put_vertex_index(self.widths.vertex, v);
            }
        }

        w.put_i32(doc.textures.len() as i32);
        for path in &doc.textures {
            w.put_text(path, self.codec);
        }

        w.put_i32(doc.materials.len() as i32);
        for material in &doc.materials {
            self.material(w, material);
        }

        w.put_i32(doc.bones.len() as i32);
        for bone in &doc.bones {
            self.bone(w, bone);
        }

        w.put_i32(doc.morphs.len() as i32);
        for morph in &doc.morphs {
            self.morph(w, morph);
        }

        w.put_i32(doc.display_frames.len() as i32);
        for frame in &doc.display_frames {
            w.put_text(&frame.name, self.codec);
            w.put_text(&frame.name_en, self.codec);
            w.put_u8(u8::from(frame.special));
            w.put_i32(frame.elements.len() as i32);
            for element in &frame.elements {
                match element {
                    DisplayElement::Bone(bone) => {
                        w.put_u8(0);
                        w.put_index(self.widths.bone, *bone);
                    }
                    DisplayElement::Morph(morph) => {
                        w.put_u8(1);
                        w.put_index(self.widths.morph, *morph);
                    }
                }
            }
        }

        w.put_i32(doc.rigid_bodies.len() as i32);
        for body in &doc.rigid_bodies {
            self.rigid_body(w, body);
        }

        w.put_i32(doc.joints.len() as i32);
        for joint in &doc.joints {
            self.joint(w, joint);
        }
    }

    fn vertex(&self, w: &mut Writer, vertex: &Vertex) {
        w.put_vec3(vertex.position);
        w.put_vec3(vertex.normal);
        w.put_vec2(vertex.uv);
        for &channel in &vertex.extra_uvs {
            w.put_vec4(channel);
        }
        let bone = self.widths.bone;
        match &vertex.skinning {
            Skinning::Bdef1 { bone: b } => {
                w.put_u8(0);
                w.put_index(bone, *b);
            }
            Skinning::Bdef2 { bones, weight } => {
                w.put_u8(1);
                w.put_index(bone, bones[0]);
                w.put_index(bone, bones[1]);
                w.put_f32(*weight);
            }
            Skinning::Bdef4 { bones, weights } => {
                w.put_u8(2);
                for &b in bones {
                    w.put_index(bone, b);
                }
                w.put_vec4(*weights);
            }
            Skinning::Sdef {
                bones,
                weight,
                c,
                r0,
                r1,
            } => {
                w.put_u8(3);
                w.put_index(bone, bones[0]);
                w.put_index(bone, bones[1]);
                w.put_f32(*weight);
                w.put_vec3(*c);
                w.put_vec3(*r0);
                w.put_vec3(*r1);
            }
            Skinning::Qdef { bones, weights } => {
                w.put_u8(4);
                for &b in bones {
                    w.put_index(bone, b);
                }
                w.put_vec4(*weights);
            }
        }
        w.put_f32(vertex.edge_scale);
    }

    fn material(&self, w: &mut Writer, material: &Material) {
        w.put_text(&material.name, self.codec);
        w.put_text(&material.name_en, self.codec);
        w.put_vec4(material.diffuse);
        w.put_vec3(material.specular);
        w.put_f32(material.shininess);
        w.put_vec3(material.ambient);
        let mut flags = 0u8;
        if material.double_sided {
            flags |= 0x01;
        }
        if material.ground_shadow {
            flags |= 0x02;
        }
        if material.cast_self_shadow {
            flags |= 0x04;
        }
        if material.receive_self_shadow {
            flags |= 0x08;
        }
        if material.edge {
            flags |= 0x10;
        }
        w.put_u8(flags);
        w.put_vec4(material.edge_color);
        w.put_f32(material.edge_size);
        w.put_index(self.widths.texture, material.texture);
        w.put_index(self.widths.texture, material.sphere_texture);
        w.put_u8(match material.sphere_mode {
            SphereMode::None => 0,
            SphereMode::Multiply => 1,
            SphereMode::Add => 2,
            SphereMode::SubTexture => 3,
        });
        match material.toon {
            Toon::Shared(slot) => {
                w.put_u8(1);
                w.put_u8(slot);
            }
            Toon::Texture(idx) => {
                w.put_u8(0);
                w.put_index(self.widths.texture, idx);
            }
        }
        w.put_text(&material.memo, self.codec);
        w.put_i32(material.face_vertex_count as i32);
    }

    fn bone(&self, w: &mut Writer, bone: &crate::document::Bone) {
        let width = self.widths.bone;
        w.put_text(&bone.name, self.codec);
        w.put_text(&bone.name_en, self.codec);
        w.put_vec3(bone.position);
        w.put_index(width, bone.parent);
        w.put_i32(bone.deform_layer);

        let mut flags = 0u16;
        if matches!(bone.tail, BoneTail::Bone(_)) {
            flags |= 0x0001;
        }
        if bone.rotatable {
            flags |= 0x0002;
        }
        if bone.translatable {
            flags |= 0x0004;
        }
        if bone.visible {
            flags |= 0x0008;
        }
        if bone.operable {
            flags |= 0x0010;
        }
        if bone.ik.is_some() {
            flags |= 0x0020;
        }
        if let Some(inherit) = &bone.inherit {
            if inherit.local {
                flags |= 0x0080;
            }
            if inherit.rotation {
                flags |= 0x0100;
            }
            if inherit.translation {
                flags |= 0x0200;
            }
        }
        if bone.fixed_axis.is_some() {
            flags |= 0x0400;
        }
        if bone.local_axes.is_some() {
            flags |= 0x0800;
        }
        if bone.after_physics {
            flags |= 0x1000;
        }
        if bone.external_parent.is_some() {
            flags |= 0x2000;
        }
        w.put_u16(flags);

        match bone.tail {
            BoneTail::Bone(tail) => w.put_index(width, tail),
            BoneTail::Offset(offset) => w.put_vec3(offset),
        }
        if let Some(inherit) = &bone.inherit {
            w.put_index(width, inherit.source);
            w.put_f32(inherit.influence);
        }
        if let Some(axis) = bone.fixed_axis {
            w.put_vec3(axis);
        }
        if let Some(axes) = &bone.local_axes {
            w.put_vec3(axes.x);
            w.put_vec3(axes.z);
        }
        if let Some(key) = bone.external_parent {
            w.put_i32(key);
        }
        if let Some(ik) = &bone.ik {
            w.put_index(width, ik.target);
            w.put_i32(ik.loop_count);
            w.put_f32(ik.limit_angle);
            w.put_i32(ik.links.len() as i32);
            for link in &ik.links {
                w.put_index(width, link.bone);
                match &link.limits {
                    Some(limits) => {
                        w.put_u8(1);
                        w.put_vec3(limits.lower);
                        w.put_vec3(limits.upper);
                    }
                    None => w.put_u8(0),
                }
            }
        }
    }

    fn morph(&self, w: &mut Writer, morph: &Morph) {
        w.put_text(&morph.name, self.codec);
        w.put_text(&morph.name_en, self.codec);
        w.put_u8(match morph.panel {
            MorphPanel::Reserved => 0,
            MorphPanel::Eyebrow => 1,
            MorphPanel::Eye => 2,
            MorphPanel::Mouth => 3,
            MorphPanel::Other => 4,
        });
        match &morph.offsets {
            MorphOffsets::Group(offsets) => {
                w.put_u8(0);
                w.put_i32(offsets.len() as i32);
                for o in offsets {
                    w.put_index(self.widths.morph, o.morph);
                    w.put_f32(o.weight);
                }
            }
            MorphOffsets::Vertex(offsets) => {
                w.put_u8(1);
                w.put_i32(offsets.len() as i32);
                for o in offsets {
                    w.put_vertex_index(self.widths.vertex, o.vertex);
                    w.put_vec3(o.offset);
                }
            }
            MorphOffsets::Bone(offsets) => {
                w.put_u8(2);
                w.put_i32(offsets.len() as i32);
                for o in offsets {
                    w.put_index(self.widths.bone, o.bone);
                    w.put_vec3(o.translation);
                    w.put_vec4(o.rotation);
                }
            }
            MorphOffsets::Uv { channel, offsets } => {
                w.put_u8(3 + channel);
                w.put_i32(offsets.len() as i32);
                for o in offsets {
                    w.put_vertex_index(self.widths.vertex, o.vertex);
                    w.put_vec4(o.offset);
                }
            }
            MorphOffsets::Material(offsets) => {
                w.put_u8(8);
                w.put_i32(offsets.len() as i32);
                for o in offsets {
                    w.put_index(self.widths.material, o.material);
                    w.put_u8(match o.operation {
                        MaterialMorphOp::Multiply => 0,
                        MaterialMorphOp::Add => 1,
                    });
                    w.put_vec4(o.diffuse);
                    w.put_vec3(o.specular);
                    w.put_f32(o.shininess);
                    w.put_vec3(o.ambient);
                    w.put_vec4(o.edge_color);
                    w.put_f32(o.edge_size);
                    w.put_vec4(o.texture);
                    w.put_vec4(o.sphere);
                    w.put_vec4(o.toon);
                }
            }
        }
    }

    fn rigid_body(&self, w: &mut Writer, body: &RigidBody) {
        w.put_text(&body.name, self.codec);
        w.put_text(&body.name_en, self.codec);
        w.put_index(self.widths.bone, body.bone);
        w.put_u8(body.group);
        w.put_u16(body.collision_mask);
        w.put_u8(match body.shape {
            RigidBodyShape::Sphere => 0,
            RigidBodyShape::Box => 1,
            RigidBodyShape::Capsule => 2,
        });
        w.put_vec3(body.size);
        w.put_vec3(body.position);
        w.put_vec3(body.rotation);
        w.put_f32(body.mass);
        w.put_f32(body.linear_damping);
        w.put_f32(body.angular_damping);
        w.put_f32(body.restitution);
        w.put_f32(body.friction);
        w.put_u8(match body.mode {
            RigidBodyMode::FollowBone => 0,
            RigidBodyMode::Physics => 1,
            RigidBodyMode::PhysicsWithBone => 2,
        });
    }

    fn joint(&self, w: &mut Writer, joint: &Joint) {
        w.put_text(&joint.name, self.codec);
        w.put_text(&joint.name_en, self.codec);
        w.put_u8(match joint.kind {
            JointKind::Spring6Dof => 0,
            JointKind::SixDof => 1,
            JointKind::PointToPoint => 2,
            JointKind::ConeTwist => 3,
            JointKind::Slider => 4,
            JointKind::Hinge => 5,
        });
        w.put_index(self.widths.rigid, joint.rigid_a);
        w.put_index(self.widths.rigid, joint.rigid_b);
        w.put_vec3(joint.position);
        w.put_vec3(joint.rotation);
        w.put_vec3(joint.linear_lower);
        w.put_vec3(joint.linear_upper);
        w.put_vec3(joint.angular_lower);
        w.put_vec3(joint.angular_upper);
        w.put_vec3(joint.spring_linear);
        w.put_vec3(joint.spring_angular);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Bone;

    #[test]
    fn invalid_document_is_refused() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf8);
        doc.bones.push(Bone {
            name: "a".into(),
            name_en: String::new(),
            position: [0.0; 3],
            parent: Some(7),
            deform_layer: 0,
            tail: BoneTail::Offset([0.0; 3]),
            rotatable: true,
            translatable: false,
            visible: true,
            operable: true,
            inherit: None,
            fixed_axis: None,
            local_axes: None,
            after_physics: false,
            external_parent: None,
            ik: None,
        });
        let err = encode_model(&doc).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { .. }));
    }

    #[test]
    fn legacy_document_is_promoted() {
        let doc = ModelDocument::new(ModelVersion::Pmd10, TextCodec::ShiftJis);
        let bytes = encode_model(&doc).unwrap();
        assert_eq!(&bytes[..4], b"PMX ");
        assert_eq!(f32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2.0);
        // Globals byte 0 is the text encoding: 0 is UTF-16LE.
        assert_eq!(bytes[9], 0);
    }

    #[test]
    fn qdef_forces_version_21() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf8);
        doc.vertices.push(Vertex {
            position: [0.0; 3],
            normal: [0.0, 1.0, 0.0],
            uv: [0.0; 2],
            extra_uvs: Vec::new(),
            skinning: Skinning::Qdef {
                bones: [None; 4],
                weights: [1.0, 0.0, 0.0, 0.0],
            },
            edge_scale: 1.0,
        });
        let bytes = encode_model(&doc).unwrap();
        let version = f32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert!((version - 2.1).abs() < 1e-6);
    }
}
