//! In-memory representation of a parsed model file.
//!
//! A `ModelDocument` is a plain value graph: element lists reference each
//! other by index, never by pointer, mirroring the on-disk layout. Documents
//! are produced whole by a decode call and consumed whole by an encode or
//! materialize call; nothing in this module touches the filesystem.

use crate::error::Error;
use crate::parsers::TextCodec;

/// Format revision the document was read from. The legacy 1.0 format is
/// import-only; encoding a `Pmd10` document promotes it to PMX 2.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    Pmd10,
    Pmx20,
    Pmx21,
}

impl ModelVersion {
    pub fn is_legacy(self) -> bool {
        matches!(self, ModelVersion::Pmd10)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelHeader {
    pub version: ModelVersion,
    /// Codec of the name/comment fields as declared in the file header.
    pub text_codec: TextCodec,
    /// Number of extra UV channels each vertex carries, 0 to 4.
    pub extra_uv_count: u8,
}

/// Skinning data of one vertex. The weighting scheme is chosen per vertex.
#[derive(Debug, Clone, PartialEq)]
pub enum Skinning {
    Bdef1 {
        bone: Option<u32>,
    },
    Bdef2 {
        bones: [Option<u32>; 2],
        weight: f32,
    },
    Bdef4 {
        bones: [Option<u32>; 4],
        weights: [f32; 4],
    },
    /// Spherical deform: BDEF2 plus a center and two range points.
    Sdef {
        bones: [Option<u32>; 2],
        weight: f32,
        c: [f32; 3],
        r0: [f32; 3],
        r1: [f32; 3],
    },
    /// Dual-quaternion deform, PMX 2.1 only. Same payload as BDEF4.
    Qdef {
        bones: [Option<u32>; 4],
        weights: [f32; 4],
    },
}

impl Skinning {
    fn bones_mut(&mut self) -> &mut [Option<u32>] {
        match self {
            Skinning::Bdef1 { bone } => std::slice::from_mut(bone),
            Skinning::Bdef2 { bones, .. } | Skinning::Sdef { bones, .. } => bones,
            Skinning::Bdef4 { bones, .. } | Skinning::Qdef { bones, .. } => bones,
        }
    }

    fn bones(&self) -> &[Option<u32>] {
        match self {
            Skinning::Bdef1 { bone } => std::slice::from_ref(bone),
            Skinning::Bdef2 { bones, .. } | Skinning::Sdef { bones, .. } => bones,
            Skinning::Bdef4 { bones, .. } | Skinning::Qdef { bones, .. } => bones,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// One entry per channel declared in `ModelHeader::extra_uv_count`.
    pub extra_uvs: Vec<[f32; 4]>,
    pub skinning: Skinning,
    pub edge_scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SphereMode {
    None,
    Multiply,
    Add,
    /// The sphere texture is applied through the extra UV channel.
    SubTexture,
}

/// Toon shading reference: either one of the ten built-in toon ramps or a
/// texture from the document's texture list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toon {
    Shared(u8),
    Texture(Option<u32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub name_en: String,
    pub diffuse: [f32; 4],
    pub specular: [f32; 3],
    pub shininess: f32,
    pub ambient: [f32; 3],
    pub double_sided: bool,
    pub ground_shadow: bool,
    pub cast_self_shadow: bool,
    pub receive_self_shadow: bool,
    pub edge: bool,
    pub edge_color: [f32; 4],
    pub edge_size: f32,
    pub texture: Option<u32>,
    pub sphere_texture: Option<u32>,
    pub sphere_mode: SphereMode,
    pub toon: Toon,
    pub memo: String,
    /// Number of entries of the face index stream this material covers.
    /// Always a multiple of 3; the slices of consecutive materials partition
    /// the stream in order.
    pub face_vertex_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoneTail {
    Offset([f32; 3]),
    Bone(Option<u32>),
}

/// Weighted rotation/translation inherited from another bone.
#[derive(Debug, Clone, PartialEq)]
pub struct InheritedTransform {
    pub rotation: bool,
    pub translation: bool,
    /// Applied in the local frame instead of the parent frame.
    pub local: bool,
    pub source: Option<u32>,
    pub influence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalAxes {
    pub x: [f32; 3],
    pub z: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct AngleLimit {
    pub lower: [f32; 3],
    pub upper: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct IkLink {
    pub bone: Option<u32>,
    pub limits: Option<AngleLimit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ik {
    pub target: Option<u32>,
    pub loop_count: i32,
    /// Rotation constraint per solver iteration, in radians.
    pub limit_angle: f32,
    pub links: Vec<IkLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bone {
    pub name: String,
    pub name_en: String,
    pub position: [f32; 3],
    pub parent: Option<u32>,
    pub deform_layer: i32,
    pub tail: BoneTail,
    pub rotatable: bool,
    pub translatable: bool,
    pub visible: bool,
    pub operable: bool,
    pub inherit: Option<InheritedTransform>,
    pub fixed_axis: Option<[f32; 3]>,
    pub local_axes: Option<LocalAxes>,
    pub after_physics: bool,
    pub external_parent: Option<i32>,
    pub ik: Option<Ik>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphPanel {
    Reserved,
    Eyebrow,
    Eye,
    Mouth,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMorphOffset {
    pub morph: Option<u32>,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexMorphOffset {
    pub vertex: u32,
    pub offset: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoneMorphOffset {
    pub bone: Option<u32>,
    pub translation: [f32; 3],
    pub rotation: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct UvMorphOffset {
    pub vertex: u32,
    pub offset: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialMorphOp {
    Multiply,
    Add,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialMorphOffset {
    /// `None` targets every material at once.
    pub material: Option<u32>,
    pub operation: MaterialMorphOp,
    pub diffuse: [f32; 4],
    pub specular: [f32; 3],
    pub shininess: f32,
    pub ambient: [f32; 3],
    pub edge_color: [f32; 4],
    pub edge_size: f32,
    pub texture: [f32; 4],
    pub sphere: [f32; 4],
    pub toon: [f32; 4],
}

/// Offset list of a morph, tagged by target kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MorphOffsets {
    Group(Vec<GroupMorphOffset>),
    Vertex(Vec<VertexMorphOffset>),
    Bone(Vec<BoneMorphOffset>),
    /// `channel` 0 targets the base UV layer, 1 to 4 the extra layers.
    Uv {
        channel: u8,
        offsets: Vec<UvMorphOffset>,
    },
    Material(Vec<MaterialMorphOffset>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Morph {
    pub name: String,
    pub name_en: String,
    pub panel: MorphPanel,
    pub offsets: MorphOffsets,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayElement {
    Bone(Option<u32>),
    Morph(Option<u32>),
}

/// UI-only named grouping of bones and morphs. No render or physics effect.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub name: String,
    pub name_en: String,
    pub special: bool,
    pub elements: Vec<DisplayElement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigidBodyShape {
    Sphere,
    Box,
    Capsule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigidBodyMode {
    /// The body is kinematic and tracks its bone.
    FollowBone,
    /// The bone tracks the simulated body.
    Physics,
    /// Simulated rotation, bone-driven translation.
    PhysicsWithBone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RigidBody {
    pub name: String,
    pub name_en: String,
    pub bone: Option<u32>,
    pub group: u8,
    /// Bit mask of the collision groups this body does not collide with.
    pub collision_mask: u16,
    pub shape: RigidBodyShape,
    pub size: [f32; 3],
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub mode: RigidBodyMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointKind {
    Spring6Dof,
    SixDof,
    PointToPoint,
    ConeTwist,
    Slider,
    Hinge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Joint {
    pub name: String,
    pub name_en: String,
    pub kind: JointKind,
    pub rigid_a: Option<u32>,
    pub rigid_b: Option<u32>,
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub linear_lower: [f32; 3],
    pub linear_upper: [f32; 3],
    pub angular_lower: [f32; 3],
    pub angular_upper: [f32; 3],
    pub spring_linear: [f32; 3],
    pub spring_angular: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDocument {
    pub header: ModelHeader,
    pub name: String,
    pub name_en: String,
    pub comment: String,
    pub comment_en: String,
    pub vertices: Vec<Vertex>,
    /// Front faces wind clockwise, as in the source format.
    pub faces: Vec<[u32; 3]>,
    /// Relative texture paths, referenced by index. Decoding keeps the
    /// file's entries verbatim; only [`ModelDocument::intern_texture`]
    /// deduplicates.
    pub textures: Vec<String>,
    pub materials: Vec<Material>,
    pub bones: Vec<Bone>,
    pub morphs: Vec<Morph>,
    pub display_frames: Vec<DisplayFrame>,
    pub rigid_bodies: Vec<RigidBody>,
    pub joints: Vec<Joint>,
}

impl ModelDocument {
    pub fn new(version: ModelVersion, text_codec: TextCodec) -> Self {
        ModelDocument {
            header: ModelHeader {
                version,
                text_codec,
                extra_uv_count: 0,
            },
            name: String::new(),
            name_en: String::new(),
            comment: String::new(),
            comment_en: String::new(),
            vertices: Vec::new(),
            faces: Vec::new(),
            textures: Vec::new(),
            materials: Vec::new(),
            bones: Vec::new(),
            morphs: Vec::new(),
            display_frames: Vec::new(),
            rigid_bodies: Vec::new(),
            joints: Vec::new(),
        }
    }

    /// Checks every cross-reference and structural invariant of the document.
    ///
    /// Ran by the decoders before a document is handed out and by the encoder
    /// before bytes are produced, so an `Ok` document is internally
    /// consistent no matter where it came from.
    pub fn validate(&self) -> Result<(), Error> {
        let vertex_count = self.vertices.len() as u32;
        let texture_count = self.textures.len() as u32;
        let material_count = self.materials.len() as u32;
        let bone_count = self.bones.len() as u32;
        let morph_count = self.morphs.len() as u32;
        let rigid_count = self.rigid_bodies.len() as u32;

        let check = |section: &'static str, what: &str, idx: Option<u32>, count: u32| {
            match idx {
                Some(i) if i >= count => Err(Error::malformed(
                    section,
                    format!("{} index {} out of range ({} elements)", what, i, count),
                )),
                _ => Ok(()),
            }
        };

        for (i, vertex) in self.vertices.iter().enumerate() {
            if vertex.extra_uvs.len() != usize::from(self.header.extra_uv_count) {
                return Err(Error::malformed(
                    "vertex",
                    format!(
                        "vertex {} has {} extra UV channels, header declares {}",
                        i,
                        vertex.extra_uvs.len(),
                        self.header.extra_uv_count
                    ),
                ));
            }
            for bone in vertex.skinning.bones() {
                check("vertex", "skinning bone", *bone, bone_count)?;
            }
        }

        for face in &self.faces {
            for &v in face {
                check("face", "vertex", Some(v), vertex_count)?;
            }
        }

        let covered: u64 = self
            .materials
            .iter()
            .map(|m| u64::from(m.face_vertex_count))
            .sum();
        if !self.materials.is_empty() && covered != self.faces.len() as u64 * 3 {
            return Err(Error::malformed(
                "material",
                format!(
                    "materials cover {} face vertices, face stream has {}",
                    covered,
                    self.faces.len() * 3
                ),
            ));
        }
        for material in &self.materials {
            if material.face_vertex_count % 3 != 0 {
                return Err(Error::malformed(
                    "material",
                    format!(
                        "face vertex count {} is not a multiple of 3",
                        material.face_vertex_count
                    ),
                ));
            }
            check("material", "texture", material.texture, texture_count)?;
            check(
                "material",
                "sphere texture",
                material.sphere_texture,
                texture_count,
            )?;
            if let Toon::Texture(t) = material.toon {
                check("material", "toon texture", t, texture_count)?;
            }
        }

        for bone in &self.bones {
            check("bone", "parent", bone.parent, bone_count)?;
            if let BoneTail::Bone(tail) = bone.tail {
                check("bone", "tail", tail, bone_count)?;
            }
            if let Some(inherit) = &bone.inherit {
                check("bone", "inherit source", inherit.source, bone_count)?;
            }
            if let Some(ik) = &bone.ik {
                check("bone", "ik target", ik.target, bone_count)?;
                for link in &ik.links {
                    check("bone", "ik link", link.bone, bone_count)?;
                }
            }
        }
        self.check_bone_parents_acyclic()?;

        for morph in &self.morphs {
            match &morph.offsets {
                MorphOffsets::Group(offsets) => {
                    for o in offsets {
                        check("morph", "group member", o.morph, morph_count)?;
                    }
                }
                MorphOffsets::Vertex(offsets) => {
                    for o in offsets {
                        check("morph", "vertex", Some(o.vertex), vertex_count)?;
                    }
                }
                MorphOffsets::Bone(offsets) => {
                    for o in offsets {
                        check("morph", "bone", o.bone, bone_count)?;
                    }
                }
                MorphOffsets::Uv { channel, offsets } => {
                    if *channel > self.header.extra_uv_count {
                        return Err(Error::malformed(
                            "morph",
                            format!("uv morph channel {} not declared in header", channel),
                        ));
                    }
                    for o in offsets {
                        check("morph", "vertex", Some(o.vertex), vertex_count)?;
                    }
                }
                MorphOffsets::Material(offsets) => {
                    for o in offsets {
                        check("morph", "material", o.material, material_count)?;
                    }
                }
            }
        }

        for frame in &self.display_frames {
            for element in &frame.elements {
                match element {
                    DisplayElement::Bone(b) => check("display frame", "bone", *b, bone_count)?,
                    DisplayElement::Morph(m) => check("display frame", "morph", *m, morph_count)?,
                }
            }
        }

        for body in &self.rigid_bodies {
            check("rigid body", "bone", body.bone, bone_count)?;
        }
        for joint in &self.joints {
            check("joint", "rigid body", joint.rigid_a, rigid_count)?;
            check("joint", "rigid body", joint.rigid_b, rigid_count)?;
        }

        Ok(())
    }

    /// The parent graph must be a forest. Walking up from any bone more steps
    /// than there are bones proves a cycle without risking an endless loop.
    fn check_bone_parents_acyclic(&self) -> Result<(), Error> {
        for (i, _) in self.bones.iter().enumerate() {
            let mut current = i;
            for _ in 0..=self.bones.len() {
                match self.bones[current].parent {
                    Some(parent) => current = parent as usize,
                    None => break,
                }
                if current == i {
                    return Err(Error::malformed(
                        "bone",
                        format!("bone {} is part of a parent cycle", i),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Applies a uniform scale to every positional quantity. Directions,
    /// rotations, UVs and physics coefficients are left alone. Unit policy
    /// belongs to the caller, the decoders never scale.
    pub fn scaled(mut self, factor: f32) -> Self {
        let scale3 = |v: &mut [f32; 3]| {
            v[0] *= factor;
            v[1] *= factor;
            v[2] *= factor;
        };
        for vertex in &mut self.vertices {
            scale3(&mut vertex.position);
            if let Skinning::Sdef { c, r0, r1, .. } = &mut vertex.skinning {
                scale3(c);
                scale3(r0);
                scale3(r1);
            }
        }
        for bone in &mut self.bones {
            scale3(&mut bone.position);
            if let BoneTail::Offset(offset) = &mut bone.tail {
                scale3(offset);
            }
        }
        for morph in &mut self.morphs {
            match &mut morph.offsets {
                MorphOffsets::Vertex(offsets) => {
                    for o in offsets {
                        scale3(&mut o.offset);
                    }
                }
                MorphOffsets::Bone(offsets) => {
                    for o in offsets {
                        scale3(&mut o.translation);
                    }
                }
                _ => {}
            }
        }
        for body in &mut self.rigid_bodies {
            scale3(&mut body.size);
            scale3(&mut body.position);
        }
        for joint in &mut self.joints {
            scale3(&mut joint.position);
            scale3(&mut joint.linear_lower);
            scale3(&mut joint.linear_upper);
        }
        self
    }

    /// Interns `path` in the texture list, returning its index. Paths are
    /// deduplicated exactly, without case folding.
    pub fn intern_texture(&mut self, path: &str) -> u32 {
        if let Some(i) = self.textures.iter().position(|t| t == path) {
            return i as u32;
        }
        self.textures.push(path.to_owned());
        (self.textures.len() - 1) as u32
    }

    /// Drops every bone reference from the skinning data. Used when the
    /// armature section is filtered out of an import.
    pub(crate) fn strip_skinning_references(&mut self) {
        for vertex in &mut self.vertices {
            for bone in vertex.skinning.bones_mut() {
                *bone = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bone(name: &str, parent: Option<u32>) -> Bone {
        Bone {
            name: name.to_owned(),
            name_en: String::new(),
            position: [0.0; 3],
            parent,
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
        }
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf16Le);
        doc.bones.push(bone("a", Some(1)));
        doc.bones.push(bone("b", Some(0)));
        let err = doc.validate().unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "bone", .. }));
    }

    #[test]
    fn self_parent_is_rejected() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf16Le);
        doc.bones.push(bone("a", Some(0)));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn chain_without_cycle_passes() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf16Le);
        doc.bones.push(bone("root", None));
        doc.bones.push(bone("mid", Some(0)));
        doc.bones.push(bone("tip", Some(1)));
        doc.validate().unwrap();
    }

    #[test]
    fn scaled_leaves_directions_alone() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf16Le);
        let mut b = bone("axis", None);
        b.position = [1.0, 2.0, 3.0];
        b.fixed_axis = Some([0.0, 1.0, 0.0]);
        doc.bones.push(b);
        let doc = doc.scaled(0.5);
        assert_eq!(doc.bones[0].position, [0.5, 1.0, 1.5]);
        assert_eq!(doc.bones[0].fixed_axis, Some([0.0, 1.0, 0.0]));
    }

    #[test]
    fn intern_texture_deduplicates() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf16Le);
        assert_eq!(doc.intern_texture("tex/body.png"), 0);
        assert_eq!(doc.intern_texture("tex/face.png"), 1);
        assert_eq!(doc.intern_texture("tex/body.png"), 0);
        assert_eq!(doc.textures.len(), 2);
    }
}
