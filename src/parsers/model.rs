//! Decoder for the model formats.
//!
//! The current format (magic `PMX `) declares its text codec and per-list
//! index widths in the header; the legacy sibling (magic `Pmd`) has fixed
//! widths, Shift-JIS text and a different bone/morph layout. Both are decoded
//! through one `ModelParseContext` whose `FormatVariant` flag is threaded
//! through every section method, the legacy records being normalized into the
//! same document model on the way in.
//!
//! Decoding never applies unit scaling; see `ModelDocument::scaled`.

use crate::document::{
    AngleLimit, Bone, BoneMorphOffset, BoneTail, DisplayElement, DisplayFrame, GroupMorphOffset,
    Ik, IkLink, InheritedTransform, Joint, JointKind, LocalAxes, Material, MaterialMorphOffset,
    MaterialMorphOp, ModelDocument, ModelVersion, Morph, MorphOffsets, MorphPanel, RigidBody,
    RigidBodyMode, RigidBodyShape, Skinning, SphereMode, Toon, UvMorphOffset, Vertex,
    VertexMorphOffset,
};
use crate::error::Error;
use crate::parsers::{
    finish,
    primitive::{fixed_text, index, text, vec2, vec3, vec4, vertex_index},
    IndexWidth, Result, TextCodec,
};
use log::{debug, warn};
use nom::{
    bytes::complete::{tag, take},
    number::complete::{le_f32, le_i32, le_u16, le_u32, le_u8},
    Err,
};

/// Which sibling of the format family is being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVariant {
    Pmx,
    Pmd,
}

/// Index widths declared in the PMX header, one per element list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexWidths {
    pub vertex: IndexWidth,
    pub texture: IndexWidth,
    pub material: IndexWidth,
    pub bone: IndexWidth,
    pub morph: IndexWidth,
    pub rigid: IndexWidth,
}

impl IndexWidths {
    /// The legacy format stores every index as two bytes.
    fn legacy() -> Self {
        IndexWidths {
            vertex: IndexWidth::Bytes2,
            texture: IndexWidth::Bytes2,
            material: IndexWidth::Bytes2,
            bone: IndexWidth::Bytes2,
            morph: IndexWidth::Bytes2,
            rigid: IndexWidth::Bytes2,
        }
    }
}

/// Decodes a model file, auto-detecting the format variant from the magic.
pub fn decode_model(input: &[u8]) -> std::result::Result<ModelDocument, Error> {
    if input.starts_with(b"PMX ") {
        finish(pmx_model(input))
    } else if input.starts_with(b"Pmd") {
        finish(pmd_model(input))
    } else {
        Err(Error::unsupported("unrecognized model file magic"))
    }
}

/// Rejects a section whose declared element count cannot possibly fit in the
/// remaining input, before any allocation happens.
fn guard_count(
    section: &'static str,
    count: usize,
    remaining: usize,
    min_record: usize,
) -> std::result::Result<(), Err<Error>> {
    if min_record > 0 && count > remaining / min_record {
        return Err(Err::Failure(Error::malformed(
            section,
            format!(
                "declared count {} exceeds remaining data ({} bytes)",
                count, remaining
            ),
        )));
    }
    Ok(())
}

pub(crate) struct ModelParseContext {
    variant: FormatVariant,
    codec: TextCodec,
    extra_uv: u8,
    widths: IndexWidths,
}

fn pmx_model(input: &[u8]) -> Result<ModelDocument> {
    let (input, _) = tag("PMX ")(input)?;
    let (input, raw_version) = le_f32(input)?;
    let version = if (raw_version - 2.0).abs() < 1e-4 {
        ModelVersion::Pmx20
    } else if (raw_version - 2.1).abs() < 1e-4 {
        ModelVersion::Pmx21
    } else {
        return Err(Err::Failure(Error::unsupported(format!(
            "PMX version {}",
            raw_version
        ))));
    };

    let (input, globals_len) = le_u8(input)?;
    if globals_len < 8 {
        return Err(Err::Failure(Error::malformed(
            "header",
            format!("{} header globals, expected at least 8", globals_len),
        )));
    }
    let (input, globals) = take(usize::from(globals_len))(input)?;

    let codec = match globals[0] {
        0 => TextCodec::Utf16Le,
        1 => TextCodec::Utf8,
        other => {
            return Err(Err::Failure(Error::unsupported(format!(
                "text encoding {}",
                other
            ))))
        }
    };
    let extra_uv = globals[1];
    if extra_uv > 4 {
        return Err(Err::Failure(Error::malformed(
            "header",
            format!("{} extra UV channels, at most 4 allowed", extra_uv),
        )));
    }
    let mut widths = [IndexWidth::Bytes1; 6];
    for (i, slot) in widths.iter_mut().enumerate() {
        *slot = IndexWidth::from_byte(globals[2 + i]).ok_or_else(|| {
            Err::Failure(Error::malformed(
                "header",
                format!("invalid index width {}", globals[2 + i]),
            ))
        })?;
    }

    let ctx = ModelParseContext {
        variant: FormatVariant::Pmx,
        codec,
        extra_uv,
        widths: IndexWidths {
            vertex: widths[0],
            texture: widths[1],
            material: widths[2],
            bone: widths[3],
            morph: widths[4],
            rigid: widths[5],
        },
    };
    ctx.pmx_body(input, version)
}

impl ModelParseContext {
    fn section_count<'b>(
        &self,
        input: &'b [u8],
        section: &'static str,
        min_record: usize,
    ) -> Result<'b, usize> {
        let (input, count) = le_i32(input)?;
        if count < 0 {
            return Err(Err::Failure(Error::malformed(
                section,
                format!("negative element count {}", count),
            )));
        }
        let count = count as usize;
        guard_count(section, count, input.len(), min_record)?;
        Ok((input, count))
    }

    fn pmx_body<'b>(&self, input: &'b [u8], version: ModelVersion) -> Result<'b, ModelDocument> {
        let mut doc = ModelDocument::new(version, self.codec);
        doc.header.extra_uv_count = self.extra_uv;

        let (input, name) = text(input, self.codec)?;
        let (input, name_en) = text(input, self.codec)?;
        let (input, comment) = text(input, self.codec)?;
        let (input, comment_en) = text(input, self.codec)?;
        doc.name = name;
        doc.name_en = name_en;
        doc.comment = comment;
        doc.comment_en = comment_en;

        // Sections follow in a fixed on-disk order.
        let min_vertex = 32 + 16 * usize::from(self.extra_uv) + 1 + self.widths.bone.bytes_num() + 4;
        let (input, count) = self.section_count(input, "vertex", min_vertex)?;
        let mut rest = input;
        doc.vertices.reserve(count);
        for _ in 0..count {
            let (input, vertex) = self.vertex(rest)?;
            doc.vertices.push(vertex);
            rest = input;
        }

        let (input, count) = self.section_count(rest, "face", self.widths.vertex.bytes_num())?;
        if count % 3 != 0 {
            return Err(Err::Failure(Error::malformed(
                "face",
                format!("index count {} is not a multiple of 3", count),
            )));
        }
        let mut rest = input;
        doc.faces.reserve(count / 3);
        for _ in 0..count / 3 {
            let (input, a) = vertex_index(rest, self.widths.vertex)?;
            let (input, b) = vertex_index(input, self.widths.vertex)?;
            let (input, c) = vertex_index(input, self.widths.vertex)?;
            doc.faces.push([a, b, c]);
            rest = input;
        }

        let (input, count) = self.section_count(rest, "texture", 4)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, path) = text(rest, self.codec)?;
            doc.textures.push(path);
            rest = input;
        }

        let min_material = 84 + 2 * self.widths.texture.bytes_num();
        let (input, count) = self.section_count(rest, "material", min_material)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, material) = self.material(rest)?;
            doc.materials.push(material);
            rest = input;
        }

        let min_bone = 26 + self.widths.bone.bytes_num();
        let (input, count) = self.section_count(rest, "bone", min_bone)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, bone) = self.bone(rest)?;
            doc.bones.push(bone);
            rest = input;
        }

        let (input, count) = self.section_count(rest, "morph", 14)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, morph) = self.morph(rest)?;
            doc.morphs.push(morph);
            rest = input;
        }

        let (input, count) = self.section_count(rest, "display frame", 13)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, frame) = self.display_frame(rest)?;
            doc.display_frames.push(frame);
            rest = input;
        }

        let min_rigid = 69 + self.widths.bone.bytes_num();
        let (input, count) = self.section_count(rest, "rigid body", min_rigid)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, body) = self.rigid_body(rest)?;
            doc.rigid_bodies.push(body);
            rest = input;
        }

        let min_joint = 105 + 2 * self.widths.rigid.bytes_num();
        let (input, count) = self.section_count(rest, "joint", min_joint)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, joint) = self.joint(rest)?;
            doc.joints.push(joint);
            rest = input;
        }

        if !rest.is_empty() {
            // PMX 2.1 appends a soft-body section. Nothing downstream
            // consumes it, so it is skipped rather than modeled.
            warn!("skipping {} trailing bytes (soft bodies?)", rest.len());
        }

        doc.validate().map_err(Err::Failure)?;
        Ok((&[], doc))
    }

    fn vertex<'b>(&self, input: &'b [u8]) -> Result<'b, Vertex> {
        let (input, position) = vec3(input)?;
        let (input, normal) = vec3(input)?;
        let (input, uv) = vec2(input)?;
        match self.variant {
            FormatVariant::Pmx => {
                let mut extra_uvs = Vec::with_capacity(usize::from(self.extra_uv));
                let mut rest = input;
                for _ in 0..self.extra_uv {
                    let (input, channel) = vec4(rest)?;
                    extra_uvs.push(channel);
                    rest = input;
                }
                let (input, skinning) = self.skinning(rest)?;
                let (input, edge_scale) = le_f32(input)?;
                Ok((
                    input,
                    Vertex {
                        position,
                        normal,
                        uv,
                        extra_uvs,
                        skinning,
                        edge_scale,
                    },
                ))
            }
            FormatVariant::Pmd => {
                let (input, bone_a) = legacy_bone_index(input)?;
                let (input, bone_b) = legacy_bone_index(input)?;
                let (input, weight) = le_u8(input)?;
                let (input, no_edge) = le_u8(input)?;
                Ok((
                    input,
                    Vertex {
                        position,
                        normal,
                        uv,
                        extra_uvs: Vec::new(),
                        skinning: Skinning::Bdef2 {
                            bones: [bone_a, bone_b],
                            weight: f32::from(weight) / 100.0,
                        },
                        edge_scale: if no_edge == 1 { 0.0 } else { 1.0 },
                    },
                ))
            }
        }
    }

    fn skinning<'b>(&self, input: &'b [u8]) -> Result<'b, Skinning> {
        let width = self.widths.bone;
        let (input, kind) = le_u8(input)?;
        match kind {
            0 => {
                let (input, bone) = index(input, width)?;
                Ok((input, Skinning::Bdef1 { bone }))
            }
            1 => {
                let (input, a) = index(input, width)?;
                let (input, b) = index(input, width)?;
                let (input, weight) = le_f32(input)?;
                Ok((
                    input,
                    Skinning::Bdef2 {
                        bones: [a, b],
                        weight,
                    },
                ))
            }
            2 | 4 => {
                let (input, a) = index(input, width)?;
                let (input, b) = index(input, width)?;
                let (input, c) = index(input, width)?;
                let (input, d) = index(input, width)?;
                let (input, weights) = vec4(input)?;
                let bones = [a, b, c, d];
                if kind == 2 {
                    Ok((input, Skinning::Bdef4 { bones, weights }))
                } else {
                    Ok((input, Skinning::Qdef { bones, weights }))
                }
            }
            3 => {
                let (input, a) = index(input, width)?;
                let (input, b) = index(input, width)?;
                let (input, weight) = le_f32(input)?;
                let (input, c) = vec3(input)?;
                let (input, r0) = vec3(input)?;
                let (input, r1) = vec3(input)?;
                Ok((
                    input,
                    Skinning::Sdef {
                        bones: [a, b],
                        weight,
                        c,
                        r0,
                        r1,
                    },
                ))
            }
            other => Err(Err::Failure(Error::malformed(
                "vertex",
                format!("unknown skinning kind {}", other),
            ))),
        }
    }

    fn material<'b>(&self, input: &'b [u8]) -> Result<'b, Material> {
        // Only the current variant reaches this method; legacy materials are
        // decoded in `pmd_body` because they intern textures as they go.
        let (input, name) = text(input, self.codec)?;
        let (input, name_en) = text(input, self.codec)?;
        let (input, diffuse) = vec4(input)?;
        let (input, specular) = vec3(input)?;
        let (input, shininess) = le_f32(input)?;
        let (input, ambient) = vec3(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, edge_color) = vec4(input)?;
        let (input, edge_size) = le_f32(input)?;
        let (input, texture) = index(input, self.widths.texture)?;
        let (input, sphere_texture) = index(input, self.widths.texture)?;
        let (input, sphere_mode) = le_u8(input)?;
        let sphere_mode = match sphere_mode {
            0 => SphereMode::None,
            1 => SphereMode::Multiply,
            2 => SphereMode::Add,
            3 => SphereMode::SubTexture,
            other => {
                return Err(Err::Failure(Error::malformed(
                    "material",
                    format!("unknown sphere mode {}", other),
                )))
            }
        };
        let (input, toon_shared) = le_u8(input)?;
        let (input, toon) = if toon_shared == 1 {
            let (input, slot) = le_u8(input)?;
            (input, Toon::Shared(slot))
        } else {
            let (input, idx) = index(input, self.widths.texture)?;
            (input, Toon::Texture(idx))
        };
        let (input, memo) = text(input, self.codec)?;
        let (input, face_vertex_count) = le_i32(input)?;
        if face_vertex_count < 0 {
            return Err(Err::Failure(Error::malformed(
                "material",
                format!("negative face vertex count {}", face_vertex_count),
            )));
        }
        Ok((
            input,
            Material {
                name,
                name_en,
                diffuse,
                specular,
                shininess,
                ambient,
                double_sided: flags & 0x01 != 0,
                ground_shadow: flags & 0x02 != 0,
                cast_self_shadow: flags & 0x04 != 0,
                receive_self_shadow: flags & 0x08 != 0,
                edge: flags & 0x10 != 0,
                edge_color,
                edge_size,
                texture,
                sphere_texture,
                sphere_mode,
                toon,
                memo,
                face_vertex_count: face_vertex_count as u32,
            },
        ))
    }

    fn bone<'b>(&self, input: &'b [u8]) -> Result<'b, Bone> {
        let width = self.widths.bone;
        let (input, name) = text(input, self.codec)?;
        let (input, name_en) = text(input, self.codec)?;
        let (input, position) = vec3(input)?;
        let (input, parent) = index(input, width)?;
        let (input, deform_layer) = le_i32(input)?;
        let (input, flags) = le_u16(input)?;

        let (input, tail) = if flags & 0x0001 != 0 {
            let (input, bone) = index(input, width)?;
            (input, BoneTail::Bone(bone))
        } else {
            let (input, offset) = vec3(input)?;
            (input, BoneTail::Offset(offset))
        };

        let inherit_rotation = flags & 0x0100 != 0;
        let inherit_translation = flags & 0x0200 != 0;
        let (input, inherit) = if inherit_rotation || inherit_translation {
            let (input, source) = index(input, width)?;
            let (input, influence) = le_f32(input)?;
            (
                input,
                Some(InheritedTransform {
                    rotation: inherit_rotation,
                    translation: inherit_translation,
                    local: flags & 0x0080 != 0,
                    source,
                    influence,
                }),
            )
        } else {
            (input, None)
        };

        let (input, fixed_axis) = if flags & 0x0400 != 0 {
            let (input, axis) = vec3(input)?;
            (input, Some(axis))
        } else {
            (input, None)
        };

        let (input, local_axes) = if flags & 0x0800 != 0 {
            let (input, x) = vec3(input)?;
            let (input, z) = vec3(input)?;
            (input, Some(LocalAxes { x, z }))
        } else {
            (input, None)
        };

        let (input, external_parent) = if flags & 0x2000 != 0 {
            let (input, key) = le_i32(input)?;
            (input, Some(key))
        } else {
            (input, None)
        };

        let (input, ik) = if flags & 0x0020 != 0 {
            let (input, target) = index(input, width)?;
            let (input, loop_count) = le_i32(input)?;
            let (input, limit_angle) = le_f32(input)?;
            let (input, link_count) = le_i32(input)?;
            if link_count < 0 {
                return Err(Err::Failure(Error::malformed(
                    "bone",
                    format!("negative IK link count {}", link_count),
                )));
            }
            guard_count("bone", link_count as usize, input.len(), width.bytes_num() + 1)?;
            let mut links = Vec::with_capacity(link_count as usize);
            let mut rest = input;
            for _ in 0..link_count {
                let (input, bone) = index(rest, width)?;
                let (input, has_limits) = le_u8(input)?;
                let (input, limits) = if has_limits == 1 {
                    let (input, lower) = vec3(input)?;
                    let (input, upper) = vec3(input)?;
                    (input, Some(AngleLimit { lower, upper }))
                } else {
                    (input, None)
                };
                links.push(IkLink { bone, limits });
                rest = input;
            }
            (
                rest,
                Some(Ik {
                    target,
                    loop_count,
                    limit_angle,
                    links,
                }),
            )
        } else {
            (input, None)
        };

        Ok((
            input,
            Bone {
                name,
                name_en,
                position,
                parent,
                deform_layer,
                tail,
                rotatable: flags & 0x0002 != 0,
                translatable: flags & 0x0004 != 0,
                visible: flags & 0x0008 != 0,
                operable: flags & 0x0010 != 0,
                inherit,
                fixed_axis,
                local_axes,
                after_physics: flags & 0x1000 != 0,
                external_parent,
                ik,
            },
        ))
    }

    fn morph<'b>(&self, input: &'b [u8]) -> Result<'b, Morph> {
        let (input, name) = text(input, self.codec)?;
        let (input, name_en) = text(input, self.codec)?;
        let (input, panel) = le_u8(input)?;
        let panel = match panel {
            0 => MorphPanel::Reserved,
            1 => MorphPanel::Eyebrow,
            2 => MorphPanel::Eye,
            3 => MorphPanel::Mouth,
            4 => MorphPanel::Other,
            other => {
                warn!("morph {:?} has unknown panel {}, treating as Other", name, other);
                MorphPanel::Other
            }
        };
        let (input, kind) = le_u8(input)?;
        let (input, offset_count) = le_i32(input)?;
        if offset_count < 0 {
            return Err(Err::Failure(Error::malformed(
                "morph",
                format!("negative offset count {}", offset_count),
            )));
        }
        let count = offset_count as usize;

        let mut rest = input;
        let offsets = match kind {
            0 => {
                guard_count("morph", count, rest.len(), self.widths.morph.bytes_num() + 4)?;
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    let (input, morph) = index(rest, self.widths.morph)?;
                    let (input, weight) = le_f32(input)?;
                    offsets.push(GroupMorphOffset { morph, weight });
                    rest = input;
                }
                MorphOffsets::Group(offsets)
            }
            1 => {
                guard_count("morph", count, rest.len(), self.widths.vertex.bytes_num() + 12)?;
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    let (input, vertex) = vertex_index(rest, self.widths.vertex)?;
                    let (input, offset) = vec3(input)?;
                    offsets.push(VertexMorphOffset { vertex, offset });
                    rest = input;
                }
                MorphOffsets::Vertex(offsets)
            }
            2 => {
                guard_count("morph", count, rest.len(), self.widths.bone.bytes_num() + 28)?;
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    let (input, bone) = index(rest, self.widths.bone)?;
                    let (input, translation) = vec3(input)?;
                    let (input, rotation) = vec4(input)?;
                    offsets.push(BoneMorphOffset {
                        bone,
                        translation,
                        rotation,
                    });
                    rest = input;
                }
                MorphOffsets::Bone(offsets)
            }
            3..=7 => {
                guard_count("morph", count, rest.len(), self.widths.vertex.bytes_num() + 16)?;
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    let (input, vertex) = vertex_index(rest, self.widths.vertex)?;
                    let (input, offset) = vec4(input)?;
                    offsets.push(UvMorphOffset { vertex, offset });
                    rest = input;
                }
                MorphOffsets::Uv {
                    channel: kind - 3,
                    offsets,
                }
            }
            8 => {
                guard_count("morph", count, rest.len(), self.widths.material.bytes_num() + 109)?;
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    let (input, material) = index(rest, self.widths.material)?;
                    let (input, operation) = le_u8(input)?;
                    let operation = match operation {
                        0 => MaterialMorphOp::Multiply,
                        1 => MaterialMorphOp::Add,
                        other => {
                            return Err(Err::Failure(Error::malformed(
                                "morph",
                                format!("unknown material morph operation {}", other),
                            )))
                        }
                    };
                    let (input, diffuse) = vec4(input)?;
                    let (input, specular) = vec3(input)?;
                    let (input, shininess) = le_f32(input)?;
                    let (input, ambient) = vec3(input)?;
                    let (input, edge_color) = vec4(input)?;
                    let (input, edge_size) = le_f32(input)?;
                    let (input, texture) = vec4(input)?;
                    let (input, sphere) = vec4(input)?;
                    let (input, toon) = vec4(input)?;
                    offsets.push(MaterialMorphOffset {
                        material,
                        operation,
                        diffuse,
                        specular,
                        shininess,
                        ambient,
                        edge_color,
                        edge_size,
                        texture,
                        sphere,
                        toon,
                    });
                    rest = input;
                }
                MorphOffsets::Material(offsets)
            }
            other => {
                return Err(Err::Failure(Error::malformed(
                    "morph",
                    format!("unknown morph kind {}", other),
                )))
            }
        };

        Ok((
            rest,
            Morph {
                name,
                name_en,
                panel,
                offsets,
            },
        ))
    }

    fn display_frame<'b>(&self, input: &'b [u8]) -> Result<'b, DisplayFrame> {
        let (input, name) = text(input, self.codec)?;
        let (input, name_en) = text(input, self.codec)?;
        let (input, special) = le_u8(input)?;
        let (input, element_count) = le_i32(input)?;
        if element_count < 0 {
            return Err(Err::Failure(Error::malformed(
                "display frame",
                format!("negative element count {}", element_count),
            )));
        }
        guard_count(
            "display frame",
            element_count as usize,
            input.len(),
            1 + self.widths.bone.bytes_num().min(self.widths.morph.bytes_num()),
        )?;
        let mut elements = Vec::with_capacity(element_count as usize);
        let mut rest = input;
        for _ in 0..element_count {
            let (input, kind) = le_u8(rest)?;
            let (input, element) = match kind {
                0 => {
                    let (input, bone) = index(input, self.widths.bone)?;
                    (input, DisplayElement::Bone(bone))
                }
                1 => {
                    let (input, morph) = index(input, self.widths.morph)?;
                    (input, DisplayElement::Morph(morph))
                }
                other => {
                    return Err(Err::Failure(Error::malformed(
                        "display frame",
                        format!("unknown element kind {}", other),
                    )))
                }
            };
            elements.push(element);
            rest = input;
        }
        Ok((
            rest,
            DisplayFrame {
                name,
                name_en,
                special: special == 1,
                elements,
            },
        ))
    }

    fn rigid_body<'b>(&self, input: &'b [u8]) -> Result<'b, RigidBody> {
        let legacy = self.variant == FormatVariant::Pmd;
        let (input, name, name_en) = if legacy {
            let (input, name) = fixed_text(input, 20, self.codec)?;
            (input, name, String::new())
        } else {
            let (input, name) = text(input, self.codec)?;
            let (input, name_en) = text(input, self.codec)?;
            (input, name, name_en)
        };
        let (input, bone) = if legacy {
            legacy_bone_index(input)?
        } else {
            index(input, self.widths.bone)?
        };
        let (input, group) = le_u8(input)?;
        let (input, collision_mask) = le_u16(input)?;
        let (input, shape) = le_u8(input)?;
        let shape = match shape {
            0 => RigidBodyShape::Sphere,
            1 => RigidBodyShape::Box,
            2 => RigidBodyShape::Capsule,
            other => {
                return Err(Err::Failure(Error::malformed(
                    "rigid body",
                    format!("unknown shape {}", other),
                )))
            }
        };
        let (input, size) = vec3(input)?;
        let (input, position) = vec3(input)?;
        let (input, rotation) = vec3(input)?;
        let (input, mass) = le_f32(input)?;
        let (input, linear_damping) = le_f32(input)?;
        let (input, angular_damping) = le_f32(input)?;
        let (input, restitution) = le_f32(input)?;
        let (input, friction) = le_f32(input)?;
        let (input, mode) = le_u8(input)?;
        let mode = match mode {
            0 => RigidBodyMode::FollowBone,
            1 => RigidBodyMode::Physics,
            2 => RigidBodyMode::PhysicsWithBone,
            other => {
                return Err(Err::Failure(Error::malformed(
                    "rigid body",
                    format!("unknown motion mode {}", other),
                )))
            }
        };
        Ok((
            input,
            RigidBody {
                name,
                name_en,
                bone,
                group,
                collision_mask,
                shape,
                size,
                position,
                rotation,
                mass,
                linear_damping,
                angular_damping,
                restitution,
                friction,
                mode,
            },
        ))
    }

    fn joint<'b>(&self, input: &'b [u8]) -> Result<'b, Joint> {
        let legacy = self.variant == FormatVariant::Pmd;
        let (input, name, name_en, kind) = if legacy {
            let (input, name) = fixed_text(input, 20, self.codec)?;
            // The legacy format has exactly one joint type.
            (input, name, String::new(), JointKind::Spring6Dof)
        } else {
            let (input, name) = text(input, self.codec)?;
            let (input, name_en) = text(input, self.codec)?;
            let (input, kind) = le_u8(input)?;
            let kind = match kind {
                0 => JointKind::Spring6Dof,
                1 => JointKind::SixDof,
                2 => JointKind::PointToPoint,
                3 => JointKind::ConeTwist,
                4 => JointKind::Slider,
                5 => JointKind::Hinge,
                other => {
                    return Err(Err::Failure(Error::malformed(
                        "joint",
                        format!("unknown joint kind {}", other),
                    )))
                }
            };
            (input, name, name_en, kind)
        };
        let (input, rigid_a, rigid_b) = if legacy {
            let (input, a) = le_u32(input)?;
            let (input, b) = le_u32(input)?;
            let none = u32::MAX;
            (
                input,
                if a == none { None } else { Some(a) },
                if b == none { None } else { Some(b) },
            )
        } else {
            let (input, a) = index(input, self.widths.rigid)?;
            let (input, b) = index(input, self.widths.rigid)?;
            (input, a, b)
        };
        let (input, position) = vec3(input)?;
        let (input, rotation) = vec3(input)?;
        let (input, linear_lower) = vec3(input)?;
        let (input, linear_upper) = vec3(input)?;
        let (input, angular_lower) = vec3(input)?;
        let (input, angular_upper) = vec3(input)?;
        let (input, spring_linear) = vec3(input)?;
        let (input, spring_angular) = vec3(input)?;
        Ok((
            input,
            Joint {
                name,
                name_en,
                kind,
                rigid_a,
                rigid_b,
                position,
                rotation,
                linear_lower,
                linear_upper,
                angular_lower,
                angular_upper,
                spring_linear,
                spring_angular,
            },
        ))
    }
}

/// Two-byte bone index of the legacy format; 0xffff means "none".
fn legacy_bone_index(input: &[u8]) -> Result<Option<u32>> {
    let (input, raw) = le_u16(input)?;
    if raw == u16::MAX {
        Ok((input, None))
    } else {
        Ok((input, Some(u32::from(raw))))
    }
}

/// Raw legacy bone record; resolved into document bones in a post-pass once
/// the whole table is known.
struct LegacyBone {
    name: String,
    parent: Option<u32>,
    tail: Option<u32>,
    kind: u8,
    target: Option<u32>,
    position: [f32; 3],
}

fn pmd_model(input: &[u8]) -> Result<ModelDocument> {
    let (input, _) = tag("Pmd")(input)?;
    let (input, raw_version) = le_f32(input)?;
    if (raw_version - 1.0).abs() > 1e-4 {
        return Err(Err::Failure(Error::unsupported(format!(
            "legacy model version {}",
            raw_version
        ))));
    }
    let ctx = ModelParseContext {
        variant: FormatVariant::Pmd,
        codec: TextCodec::ShiftJis,
        extra_uv: 0,
        widths: IndexWidths::legacy(),
    };
    ctx.pmd_body(input)
}

impl ModelParseContext {
    #[allow(clippy::too_many_lines)]
    fn pmd_body<'b>(&self, input: &'b [u8]) -> Result<'b, ModelDocument> {
        let mut doc = ModelDocument::new(ModelVersion::Pmd10, self.codec);
        let (input, name) = fixed_text(input, 20, self.codec)?;
        let (input, comment) = fixed_text(input, 256, self.codec)?;
        doc.name = name;
        doc.comment = comment;

        let (input, count) = le_u32(input)?;
        guard_count("vertex", count as usize, input.len(), 38)?;
        let mut rest = input;
        doc.vertices.reserve(count as usize);
        for _ in 0..count {
            let (input, vertex) = self.vertex(rest)?;
            doc.vertices.push(vertex);
            rest = input;
        }

        let (input, count) = le_u32(rest)?;
        guard_count("face", count as usize, input.len(), 2)?;
        if count % 3 != 0 {
            return Err(Err::Failure(Error::malformed(
                "face",
                format!("index count {} is not a multiple of 3", count),
            )));
        }
        let mut rest = input;
        doc.faces.reserve(count as usize / 3);
        for _ in 0..count / 3 {
            let (input, a) = le_u16(rest)?;
            let (input, b) = le_u16(input)?;
            let (input, c) = le_u16(input)?;
            doc.faces.push([u32::from(a), u32::from(b), u32::from(c)]);
            rest = input;
        }

        let (input, count) = le_u32(rest)?;
        guard_count("material", count as usize, input.len(), 70)?;
        let mut rest = input;
        // Shared-toon slots are resolved against the custom toon table that
        // only appears much later in the file.
        let mut pending_toon: Vec<Option<u8>> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (input, diffuse) = vec4(rest)?;
            let (input, shininess) = le_f32(input)?;
            let (input, specular) = vec3(input)?;
            let (input, ambient) = vec3(input)?;
            let (input, toon_slot) = le_u8(input)?;
            let (input, edge_flag) = le_u8(input)?;
            let (input, face_vertex_count) = le_u32(input)?;
            let (input, texture_field) = fixed_text(input, 20, self.codec)?;

            let mut texture = None;
            let mut sphere_texture = None;
            let mut sphere_mode = SphereMode::None;
            for part in texture_field.split('*').filter(|p| !p.is_empty()) {
                let lower = part.to_ascii_lowercase();
                if lower.ends_with(".sph") {
                    sphere_texture = Some(doc.intern_texture(part));
                    sphere_mode = SphereMode::Multiply;
                } else if lower.ends_with(".spa") {
                    sphere_texture = Some(doc.intern_texture(part));
                    sphere_mode = SphereMode::Add;
                } else {
                    texture = Some(doc.intern_texture(part));
                }
            }

            pending_toon.push(if toon_slot == u8::MAX {
                None
            } else {
                Some(toon_slot)
            });
            doc.materials.push(Material {
                name: String::new(),
                name_en: String::new(),
                diffuse,
                specular,
                shininess,
                ambient,
                double_sided: diffuse[3] < 1.0,
                ground_shadow: edge_flag != 0,
                cast_self_shadow: true,
                receive_self_shadow: true,
                edge: edge_flag != 0,
                edge_color: [0.0, 0.0, 0.0, 1.0],
                edge_size: 1.0,
                texture,
                sphere_texture,
                sphere_mode,
                toon: Toon::Texture(None), // placeholder until the toon table
                memo: String::new(),
                face_vertex_count,
            });
            rest = input;
        }

        let (input, count) = le_u16(rest)?;
        guard_count("bone", count as usize, input.len(), 39)?;
        let mut rest = input;
        let mut legacy_bones = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (input, name) = fixed_text(rest, 20, self.codec)?;
            let (input, parent) = legacy_bone_index(input)?;
            let (input, tail_raw) = le_u16(input)?;
            let (input, kind) = le_u8(input)?;
            let (input, target) = legacy_bone_index(input)?;
            let (input, position) = vec3(input)?;
            legacy_bones.push(LegacyBone {
                name,
                parent,
                // Tail slot 0 conventionally means "no tip bone".
                tail: if tail_raw == 0 || tail_raw == u16::MAX {
                    None
                } else {
                    Some(u32::from(tail_raw))
                },
                kind,
                target,
                position,
            });
            rest = input;
        }
        doc.bones = resolve_legacy_bones(&legacy_bones);

        // Separate IK table, folded into the bones it belongs to.
        let (input, count) = le_u16(rest)?;
        guard_count("bone", count as usize, input.len(), 11)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, ik_bone) = le_u16(rest)?;
            let (input, target) = legacy_bone_index(input)?;
            let (input, chain_len) = le_u8(input)?;
            let (input, iterations) = le_u16(input)?;
            let (input, control_weight) = le_f32(input)?;
            guard_count("bone", usize::from(chain_len), input.len(), 2)?;
            let mut links = Vec::with_capacity(usize::from(chain_len));
            let mut chain_rest = input;
            for _ in 0..chain_len {
                let (input, link) = legacy_bone_index(chain_rest)?;
                links.push(IkLink { bone: link, limits: None });
                chain_rest = input;
            }
            let ik = Ik {
                target,
                loop_count: i32::from(iterations),
                // The legacy per-iteration constraint is a quarter of the
                // current format's limit angle.
                limit_angle: control_weight * 4.0,
                links,
            };
            match doc.bones.get_mut(usize::from(ik_bone)) {
                Some(bone) => bone.ik = Some(ik),
                None => {
                    return Err(Err::Failure(Error::malformed(
                        "bone",
                        format!("IK chain references bone {} of {}", ik_bone, doc.bones.len()),
                    )))
                }
            }
            rest = chain_rest;
        }

        // Morphs are stored relative to a base record that maps morph slots
        // to real vertex indices; they are converted to absolute offsets.
        let (input, count) = le_u16(rest)?;
        guard_count("morph", count as usize, input.len(), 25)?;
        let mut rest = input;
        let mut base_vertices: Vec<u32> = Vec::new();
        for _ in 0..count {
            let (input, name) = fixed_text(rest, 20, self.codec)?;
            let (input, offset_count) = le_u32(input)?;
            let (input, panel) = le_u8(input)?;
            guard_count("morph", offset_count as usize, input.len(), 16)?;
            let mut records = Vec::with_capacity(offset_count as usize);
            let mut record_rest = input;
            for _ in 0..offset_count {
                let (input, slot) = le_u32(record_rest)?;
                let (input, offset) = vec3(input)?;
                records.push((slot, offset));
                record_rest = input;
            }
            rest = record_rest;

            if panel == 0 {
                base_vertices = records.iter().map(|&(slot, _)| slot).collect();
                continue;
            }
            let mut offsets = Vec::with_capacity(records.len());
            for (slot, offset) in records {
                let vertex = *base_vertices.get(slot as usize).ok_or_else(|| {
                    Err::Failure(Error::malformed(
                        "morph",
                        format!(
                            "morph slot {} out of range ({} base records)",
                            slot,
                            base_vertices.len()
                        ),
                    ))
                })?;
                offsets.push(VertexMorphOffset { vertex, offset });
            }
            doc.morphs.push(Morph {
                name,
                name_en: String::new(),
                panel: match panel {
                    1 => MorphPanel::Eyebrow,
                    2 => MorphPanel::Eye,
                    3 => MorphPanel::Mouth,
                    _ => MorphPanel::Other,
                },
                offsets: MorphOffsets::Vertex(offsets),
            });
        }

        // Display data: a morph list, frame names and bone/frame pairs.
        let (input, count) = le_u8(rest)?;
        guard_count("display frame", usize::from(count), input.len(), 2)?;
        let mut rest = input;
        let mut expression_elements = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (input, slot) = le_u16(rest)?;
            // Slot 0 is the base morph, which the document does not carry.
            expression_elements.push(DisplayElement::Morph(
                (slot > 0).then(|| u32::from(slot - 1)),
            ));
            rest = input;
        }

        let (input, count) = le_u8(rest)?;
        guard_count("display frame", usize::from(count), input.len(), 50)?;
        let mut rest = input;
        let mut frame_names = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (input, frame_name) = fixed_text(rest, 50, self.codec)?;
            frame_names.push(frame_name);
            rest = input;
        }

        let (input, count) = le_u32(rest)?;
        guard_count("display frame", count as usize, input.len(), 3)?;
        let mut rest = input;
        let mut frame_elements: Vec<Vec<DisplayElement>> = vec![Vec::new(); frame_names.len()];
        for _ in 0..count {
            let (input, bone) = le_u16(rest)?;
            let (input, frame) = le_u8(input)?;
            rest = input;
            let slot = usize::from(frame).wrapping_sub(1);
            match frame_elements.get_mut(slot) {
                Some(elements) => elements.push(DisplayElement::Bone(Some(u32::from(bone)))),
                None => {
                    return Err(Err::Failure(Error::malformed(
                        "display frame",
                        format!("bone display entry references frame {}", frame),
                    )))
                }
            }
        }

        if !doc.bones.is_empty() {
            doc.display_frames.push(DisplayFrame {
                name: "Root".to_owned(),
                name_en: "Root".to_owned(),
                special: true,
                elements: vec![DisplayElement::Bone(Some(0))],
            });
        }
        doc.display_frames.push(DisplayFrame {
            name: "表情".to_owned(),
            name_en: "Exp".to_owned(),
            special: true,
            elements: expression_elements,
        });
        for (frame_name, elements) in frame_names.iter().zip(frame_elements) {
            doc.display_frames.push(DisplayFrame {
                name: frame_name.clone(),
                name_en: String::new(),
                special: false,
                elements,
            });
        }

        // Everything past this point is optional in old files.
        let (rest, ()) = self.pmd_english(rest, &mut doc, frame_names.len())?;
        let (rest, ()) = pmd_toon_table(rest, &mut doc, &pending_toon)?;
        let (rest, ()) = self.pmd_physics(rest, &mut doc)?;
        if !rest.is_empty() {
            debug!("ignoring {} trailing bytes of legacy model", rest.len());
        }

        doc.validate().map_err(Err::Failure)?;
        Ok((&[], doc))
    }

    /// Optional English-name block of the legacy format.
    fn pmd_english<'b>(
        &self,
        input: &'b [u8],
        doc: &mut ModelDocument,
        frame_name_count: usize,
    ) -> Result<'b, ()> {
        if input.is_empty() {
            return Ok((input, ()));
        }
        let (input, has_english) = le_u8(input)?;
        if has_english == 0 {
            return Ok((input, ()));
        }
        let (input, name_en) = fixed_text(input, 20, self.codec)?;
        let (input, comment_en) = fixed_text(input, 256, self.codec)?;
        doc.name_en = name_en;
        doc.comment_en = comment_en;

        let mut rest = input;
        for i in 0..doc.bones.len() {
            let (input, bone_name) = fixed_text(rest, 20, self.codec)?;
            doc.bones[i].name_en = bone_name;
            rest = input;
        }
        for i in 0..doc.morphs.len() {
            let (input, morph_name) = fixed_text(rest, 20, self.codec)?;
            doc.morphs[i].name_en = morph_name;
            rest = input;
        }
        // Synthesized Root/expression frames precede the named ones.
        let named_offset = doc.display_frames.len() - frame_name_count;
        for i in 0..frame_name_count {
            let (input, frame_name) = fixed_text(rest, 50, self.codec)?;
            doc.display_frames[named_offset + i].name_en = frame_name;
            rest = input;
        }
        Ok((rest, ()))
    }

    /// Optional rigid-body and joint sections of the legacy format.
    fn pmd_physics<'b>(&self, input: &'b [u8], doc: &mut ModelDocument) -> Result<'b, ()> {
        if input.is_empty() {
            return Ok((input, ()));
        }
        let (input, count) = le_u32(input)?;
        guard_count("rigid body", count as usize, input.len(), 83)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, mut body) = self.rigid_body(rest)?;
            // Legacy bodies are positioned relative to their bone.
            if let Some(bone) = body.bone {
                if let Some(bone) = doc.bones.get(bone as usize) {
                    body.position[0] += bone.position[0];
                    body.position[1] += bone.position[1];
                    body.position[2] += bone.position[2];
                }
            }
            doc.rigid_bodies.push(body);
            rest = input;
        }

        if rest.is_empty() {
            return Ok((rest, ()));
        }
        let (input, count) = le_u32(rest)?;
        guard_count("joint", count as usize, input.len(), 124)?;
        let mut rest = input;
        for _ in 0..count {
            let (input, joint) = self.joint(rest)?;
            doc.joints.push(joint);
            rest = input;
        }
        Ok((rest, ()))
    }
}

/// Optional table of ten custom toon ramp paths. A material slot pointing at
/// a non-default entry becomes a texture reference; default entries stay as
/// shared built-ins.
fn pmd_toon_table<'b>(
    input: &'b [u8],
    doc: &mut ModelDocument,
    pending_toon: &[Option<u8>],
) -> Result<'b, ()> {
    if input.is_empty() {
        for (material, slot) in doc.materials.iter_mut().zip(pending_toon) {
            material.toon = match slot {
                Some(slot) => Toon::Shared(*slot),
                None => Toon::Texture(None),
            };
        }
        return Ok((input, ()));
    }

    let mut table = Vec::with_capacity(10);
    let mut rest = input;
    for _ in 0..10 {
        let (input, entry) = fixed_text(rest, 100, TextCodec::ShiftJis)?;
        table.push(entry);
        rest = input;
    }

    let mut resolved = Vec::with_capacity(pending_toon.len());
    for slot in pending_toon {
        resolved.push(match slot {
            None => Toon::Texture(None),
            Some(slot) => {
                let entry = table.get(usize::from(*slot)).map(String::as_str).unwrap_or("");
                let default_name = format!("toon{:02}.bmp", slot + 1);
                if entry.is_empty() || entry.eq_ignore_ascii_case(&default_name) {
                    Toon::Shared(*slot)
                } else {
                    Toon::Texture(Some(doc.intern_texture(entry)))
                }
            }
        });
    }
    for (material, toon) in doc.materials.iter_mut().zip(resolved) {
        material.toon = toon;
    }
    Ok((rest, ()))
}

/// Translates the legacy bone-kind byte into the current flag set.
fn resolve_legacy_bones(legacy: &[LegacyBone]) -> Vec<Bone> {
    legacy
        .iter()
        .map(|raw| {
            let kind = raw.kind;
            let inherit = match kind {
                // Rotation-influenced bones copy rotation from another bone.
                5 | 9 => Some(InheritedTransform {
                    rotation: true,
                    translation: false,
                    local: false,
                    source: raw.target,
                    influence: 1.0,
                }),
                _ => None,
            };
            // Twist bones rotate around the axis towards their tip.
            let fixed_axis = if kind == 8 {
                raw.tail
                    .and_then(|tail| legacy.get(tail as usize))
                    .and_then(|tip| normalize_direction(raw.position, tip.position))
            } else {
                None
            };
            Bone {
                name: raw.name.clone(),
                name_en: String::new(),
                position: raw.position,
                parent: raw.parent,
                deform_layer: 0,
                tail: BoneTail::Bone(raw.tail),
                rotatable: true,
                translatable: matches!(kind, 1 | 2),
                visible: !matches!(kind, 6 | 7),
                operable: true,
                inherit,
                fixed_axis,
                local_axes: None,
                after_physics: false,
                external_parent: None,
                ik: None,
            }
        })
        .collect()
}

fn normalize_direction(from: [f32; 3], to: [f32; 3]) -> Option<[f32; 3]> {
    let d = [to[0] - from[0], to[1] - from[1], to[2] - from[2]];
    let len = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
    if len <= f32::EPSILON {
        None
    } else {
        Some([d[0] / len, d[1] / len, d[2] / len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-level fixture builder for crafting files the encoder refuses to
    /// produce, e.g. out-of-range indices.
    struct Fx(Vec<u8>);

    impl Fx {
        /// Minimal PMX header: UTF-8 text, no extra UVs, all widths 1 byte
        /// except the bone width, which the caller picks.
        fn pmx(bone_width: u8) -> Self {
            let mut fx = Fx(Vec::new());
            fx.0.extend_from_slice(b"PMX ");
            fx.f32(2.0);
            fx.u8(8);
            fx.0.extend_from_slice(&[1, 0, 1, 1, 1, bone_width, 1, 1]);
            for _ in 0..4 {
                fx.text(""); // name, name_en, comment, comment_en
            }
            fx
        }

        fn u8(&mut self, v: u8) {
            self.0.push(v);
        }
        fn u16(&mut self, v: u16) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn u32(&mut self, v: u32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn i32(&mut self, v: i32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn f32(&mut self, v: f32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn text(&mut self, s: &str) {
            self.i32(s.len() as i32);
            self.0.extend_from_slice(s.as_bytes());
        }
        fn fixed(&mut self, s: &str, len: usize) {
            let mut field = s.as_bytes().to_vec();
            field.resize(len, 0);
            self.0.extend_from_slice(&field);
        }
        fn vec3(&mut self, v: [f32; 3]) {
            for c in v {
                self.f32(c);
            }
        }
        /// name, name_en, position, parent, layer, flags, tail offset.
        fn bone(&mut self, name: &str, parent_raw: &[u8]) {
            self.text(name);
            self.text("");
            self.vec3([0.0; 3]);
            self.0.extend_from_slice(parent_raw);
            self.i32(0);
            self.u16(0x0002);
            self.vec3([0.0; 3]);
        }
        fn empty_sections(&mut self, n: usize) {
            for _ in 0..n {
                self.i32(0);
            }
        }
    }

    #[test]
    fn bad_magic_is_unsupported() {
        let err = decode_model(b"OBJ file").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn bad_version_is_unsupported() {
        let mut bytes = b"PMX ".to_vec();
        bytes.extend_from_slice(&3.0f32.to_le_bytes());
        bytes.extend_from_slice(&[8, 0, 0, 1, 1, 1, 1, 1, 1]);
        let err = decode_model(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn truncated_header_is_truncation() {
        let err = decode_model(b"PMX \x00\x00\x00@").unwrap_err();
        assert!(matches!(err, Error::TruncatedData));
    }

    #[test]
    fn truncated_mid_record_is_truncation() {
        let mut fx = Fx::pmx(1);
        fx.i32(2); // two vertices declared, one and a half present
        for _ in 0..2 {
            fx.vec3([0.0; 3]);
            fx.vec3([0.0; 3]);
        }
        let err = decode_model(&fx.0).unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedData | Error::MalformedSection { .. }
        ));
    }

    #[test]
    fn minimal_model_decodes() {
        let mut fx = Fx::pmx(1);
        fx.i32(1); // one vertex
        fx.vec3([0.0, 1.0, 0.0]);
        fx.vec3([0.0, 1.0, 0.0]);
        fx.f32(0.5);
        fx.f32(0.5);
        fx.u8(0); // BDEF1
        fx.u8(0xff); // no bone
        fx.f32(1.0);
        fx.i32(3); // one degenerate face
        fx.u8(0);
        fx.u8(0);
        fx.u8(0);
        fx.empty_sections(7); // textures .. joints

        let doc = decode_model(&fx.0).unwrap();
        assert_eq!(doc.vertices.len(), 1);
        assert_eq!(doc.faces, vec![[0, 0, 0]]);
        assert!(doc.materials.is_empty());
    }

    #[test]
    fn negative_count_is_malformed() {
        let mut fx = Fx::pmx(1);
        fx.i32(-1);
        let err = decode_model(&fx.0).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "vertex", .. }));
    }

    #[test]
    fn absurd_count_is_malformed() {
        let mut fx = Fx::pmx(1);
        fx.i32(i32::MAX);
        let err = decode_model(&fx.0).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "vertex", .. }));
    }

    #[test]
    fn out_of_range_bone_parent_is_malformed() {
        // Header declares 4-byte bone indices; the single bone's parent
        // points at slot 70000 while the table holds one bone.
        let mut fx = Fx::pmx(4);
        fx.empty_sections(4); // vertices, faces, textures, materials
        fx.i32(1);
        fx.bone("centre", &70_000i32.to_le_bytes());
        fx.empty_sections(4); // morphs .. joints
        let err = decode_model(&fx.0).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "bone", .. }));
    }

    #[test]
    fn bone_parent_cycle_is_malformed_not_hang() {
        let mut fx = Fx::pmx(1);
        fx.empty_sections(4);
        fx.i32(2);
        fx.bone("a", &[1]); // a parents b
        fx.bone("b", &[0]); // b parents a
        fx.empty_sections(4);
        let err = decode_model(&fx.0).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "bone", .. }));
    }

    #[test]
    fn minimal_legacy_model_decodes() {
        let mut fx = Fx(Vec::new());
        fx.0.extend_from_slice(b"Pmd");
        fx.f32(1.0);
        fx.fixed("model", 20);
        fx.fixed("comment", 256);

        fx.u32(1); // one vertex
        fx.vec3([0.0, 1.0, 0.0]);
        fx.vec3([0.0, 1.0, 0.0]);
        fx.f32(0.5);
        fx.f32(0.5);
        fx.u16(0); // first bone
        fx.u16(0xffff); // no second bone
        fx.u8(80); // weight percent
        fx.u8(1); // edge disabled

        fx.u32(3); // one face
        fx.u16(0);
        fx.u16(0);
        fx.u16(0);

        fx.u32(1); // one material
        for _ in 0..4 {
            fx.f32(1.0); // diffuse
        }
        fx.f32(5.0); // shininess
        fx.vec3([0.0; 3]); // specular
        fx.vec3([0.5; 3]); // ambient
        fx.u8(0xff); // no toon
        fx.u8(1); // edge flag
        fx.u32(3); // face vertex count
        fx.fixed("tex.png*sub.spa", 20);

        fx.u16(1); // one bone
        fx.fixed("center", 20);
        fx.u16(0xffff); // no parent
        fx.u16(0); // no tail
        fx.u8(0);
        fx.u16(0);
        fx.vec3([0.0; 3]);

        fx.u16(0); // no IK chains
        fx.u16(0); // no morphs
        fx.u8(0); // empty expression display list
        fx.u8(0); // no named display frames
        fx.u32(0); // no bone display entries

        let doc = decode_model(&fx.0).unwrap();
        assert_eq!(doc.header.version, ModelVersion::Pmd10);
        assert_eq!(doc.name, "model");
        assert!(matches!(
            doc.vertices[0].skinning,
            Skinning::Bdef2 { weight, .. } if (weight - 0.8).abs() < 1e-6
        ));
        assert_eq!(doc.vertices[0].edge_scale, 0.0);
        assert_eq!(doc.textures, vec!["tex.png".to_owned(), "sub.spa".to_owned()]);
        assert_eq!(doc.materials[0].sphere_mode, SphereMode::Add);
        assert_eq!(doc.bones[0].name, "center");
        // Root and expression frames are synthesized for the legacy variant.
        assert_eq!(doc.display_frames.len(), 2);
        assert!(doc.display_frames[0].special);
    }

    #[test]
    fn legacy_trailing_sections_decode() {
        let mut fx = Fx(Vec::new());
        fx.0.extend_from_slice(b"Pmd");
        fx.f32(1.0);
        fx.fixed("model", 20);
        fx.fixed("comment", 256);
        fx.u32(0); // no vertices
        fx.u32(0); // no faces

        fx.u32(1); // one material
        for _ in 0..4 {
            fx.f32(1.0);
        }
        fx.f32(5.0);
        fx.vec3([0.0; 3]);
        fx.vec3([0.5; 3]);
        fx.u8(2); // toon slot, resolved against the table below
        fx.u8(0);
        fx.u32(0);
        fx.fixed("", 20);

        fx.u16(1); // one bone
        fx.fixed("hip", 20);
        fx.u16(0xffff);
        fx.u16(0);
        fx.u8(0);
        fx.u16(0);
        fx.vec3([1.0, 2.0, 3.0]);

        fx.u16(0); // no IK chains
        fx.u16(0); // no morphs
        fx.u8(0); // empty expression display list
        fx.u8(0); // no named display frames
        fx.u32(0); // no bone display entries

        fx.u8(1); // English block present
        fx.fixed("model-en", 20);
        fx.fixed("comment-en", 256);
        fx.fixed("hip-en", 20);

        // Toon table: slot 2 carries a custom ramp, the rest are defaults.
        for i in 0..10u8 {
            if i == 2 {
                fx.fixed("mytoon.bmp", 100);
            } else {
                fx.fixed(&format!("toon{:02}.bmp", i + 1), 100);
            }
        }

        fx.u32(1); // one rigid body
        fx.fixed("hip body", 20);
        fx.u16(0);
        fx.u8(0);
        fx.u16(0xfffe);
        fx.u8(0); // sphere
        fx.vec3([0.5, 0.0, 0.0]);
        fx.vec3([0.0, 1.0, 0.0]); // relative to the bone
        fx.vec3([0.0; 3]);
        for _ in 0..5 {
            fx.f32(0.5);
        }
        fx.u8(1); // physics mode

        fx.u32(1); // one joint
        fx.fixed("link", 20);
        fx.u32(0);
        fx.u32(0);
        for _ in 0..8 {
            fx.vec3([0.0; 3]);
        }

        let doc = decode_model(&fx.0).unwrap();
        assert_eq!(doc.name_en, "model-en");
        assert_eq!(doc.bones[0].name_en, "hip-en");
        // The custom slot becomes a texture reference, interned.
        assert_eq!(doc.materials[0].toon, Toon::Texture(Some(0)));
        assert_eq!(doc.textures, vec!["mytoon.bmp".to_owned()]);
        // Legacy rigid positions are bone-relative and come out absolute.
        assert_eq!(doc.rigid_bodies[0].position, [1.0, 3.0, 3.0]);
        assert_eq!(doc.joints.len(), 1);
    }

    #[test]
    fn face_count_must_be_multiple_of_three() {
        let mut fx = Fx::pmx(1);
        fx.i32(0); // no vertices
        fx.i32(4); // not divisible by 3
        let err = decode_model(&fx.0).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "face", .. }));
    }
}
