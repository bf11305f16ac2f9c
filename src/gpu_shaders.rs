//! WGSL compute shader source for the portable device backend.
//!
//! The kernels implement the subregion overwrite path: gather scattered
//! elements of a device buffer into a compact temporary, and scatter a
//! compact temporary back out to scattered positions. They only move bits,
//! so the element alias is the type's WGSL spelling from
//! [`GpuScalar::WGSL_TYPE`](crate::scalar::GpuScalar::WGSL_TYPE) — 8-byte
//! elements ride as `vec2<u32>`.

/// Generate the kernel source for one element type.
///
/// Entry points:
/// - `gather_indices`: `dst[i] = src[indices[i]]`
/// - `scatter_indices`: `dst[indices[i]] = src[i]`
pub fn shader_source(elem: &str) -> String {
    format!(
        r#"
alias elem = {elem};

struct Params {{
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}}

@group(0) @binding(0) var<storage, read> src: array<elem>;
@group(0) @binding(1) var<storage, read_write> dst: array<elem>;
@group(0) @binding(2) var<storage, read> indices: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(64)
fn gather_indices(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if i < params.count {{
        dst[i] = src[indices[i]];
    }}
}}

@compute @workgroup_size(64)
fn scatter_indices(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if i < params.count {{
        dst[indices[i]] = src[i];
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validate that generated shader source parses without errors.
    /// Uses naga's WGSL frontend directly so this works without a GPU.
    fn assert_parses(elem: &str) {
        let source = shader_source(elem);
        match naga::front::wgsl::parse_str(&source) {
            Ok(module) => {
                let entry_names: Vec<&str> =
                    module.entry_points.iter().map(|ep| ep.name.as_str()).collect();
                for name in ["gather_indices", "scatter_indices"] {
                    assert!(
                        entry_names.contains(&name),
                        "missing entry point: {name}. Found: {entry_names:?}"
                    );
                }
            }
            Err(e) => {
                panic!("WGSL parse error for {elem}:\n{}", e.emit_to_string(&source));
            }
        }
    }

    #[test]
    fn four_byte_element_source_parses() {
        assert_parses("f32");
        assert_parses("i32");
        assert_parses("u32");
    }

    #[test]
    fn eight_byte_element_source_parses() {
        assert_parses("vec2<u32>");
    }

    #[test]
    fn source_embeds_the_element_alias() {
        let source = shader_source("vec2<u32>");
        assert!(source.contains("alias elem = vec2<u32>;"));
    }
}
