//! Builds complete GLSL programs around ShaderToy snippets.
//!
//! The fragment stage is assembled from [`FRAGMENT_TEMPLATE`] which contains
//! three explicit placeholders:
//!
//! 1. `{{PRELUDE}}` declares the uniform block, channel samplers, and the
//!    macro aliases that map ShaderToy names onto them.
//! 2. `{{USER_SOURCE}}` is the sanitized snippet: `#version` directives and
//!    re-declarations of contract uniforms are dropped so ours win.
//! 3. `{{ENTRY}}` remaps `gl_FragCoord`, calls `mainImage`, and writes the
//!    output colour.
//!
//! Substitution is single pass, so placeholder-looking text inside user code
//! is left untouched.

/// Uniform names owned by the program template.
pub const CONTRACT_UNIFORMS: [&str; 14] = [
    "iResolution",
    "iTimeDelta",
    "iTime",
    "iFrameRate",
    "iFrame",
    "iMouse",
    "iDate",
    "iSampleRate",
    "iChannelTime",
    "iChannelResolution",
    "iChannel0",
    "iChannel1",
    "iChannel2",
    "iChannel3",
];

/// Minimal snippet used to self-check a freshly launched session.
pub const PROBE_SHADER: &str = r"void mainImage(out vec4 fragColor, in vec2 fragCoord) {
    vec2 uv = fragCoord / iResolution.xy;
    fragColor = vec4(uv, 0.5 + 0.5 * sin(iTime), 1.0);
}
";

const FRAGMENT_TEMPLATE: &str = "#version 450\n{{PRELUDE}}\n#line 1\n{{USER_SOURCE}}\n{{ENTRY}}";

/// A fully assembled fragment program plus what was removed from the snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentProgram {
    pub source: String,
    pub stripped_lines: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template placeholder '{0}' has no value")]
    MissingValue(String),
    #[error("template placeholder starting at byte {0} is not terminated")]
    Unterminated(usize),
}

/// Assembles the vertex and fragment stages of the render program.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramBuilder;

impl ProgramBuilder {
    pub fn new() -> Self {
        Self
    }

    /// The fixed full-viewport stage every program links against.
    pub fn vertex_source(&self) -> &'static str {
        VERTEX_SHADER_GLSL
    }

    pub fn fragment(&self, user_source: &str) -> Result<FragmentProgram, TemplateError> {
        let (sanitized, stripped_lines) = sanitize_user_source(user_source);
        let source = render_template(
            FRAGMENT_TEMPLATE,
            &[
                ("PRELUDE", PRELUDE),
                ("USER_SOURCE", sanitized.as_str()),
                ("ENTRY", ENTRY),
            ],
        )?;
        Ok(FragmentProgram {
            source,
            stripped_lines,
        })
    }
}

/// Drops `#version` and contract uniform declarations, returning the 1-based
/// line numbers that were removed.
fn sanitize_user_source(source: &str) -> (String, Vec<usize>) {
    let mut sanitized = String::with_capacity(source.len());
    let mut stripped = Vec::new();
    let mut skipped_version = false;
    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if !skipped_version && trimmed.starts_with("#version") {
            skipped_version = true;
            stripped.push(index + 1);
            // Keep line numbering aligned with the user's file.
            sanitized.push('\n');
            continue;
        }
        if declares_contract_uniform(trimmed) {
            stripped.push(index + 1);
            sanitized.push('\n');
            continue;
        }
        sanitized.push_str(line);
        sanitized.push('\n');
    }
    (sanitized, stripped)
}

/// True for a `uniform` line that re-declares part of the built-in contract.
pub fn declares_contract_uniform(trimmed_line: &str) -> bool {
    trimmed_line.starts_with("uniform ")
        && CONTRACT_UNIFORMS.iter().any(|name| {
            trimmed_line
                .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .any(|token| token == *name)
        })
}

fn render_template(template: &str, values: &[(&str, &str)]) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(
        template.len() + values.iter().map(|(_, value)| value.len()).sum::<usize>(),
    );
    let mut rest = template;
    let mut consumed = 0;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::Unterminated(consumed + start))?;
        let name = &after[..end];
        let value = values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| TemplateError::MissingValue(name.to_string()))?;
        output.push_str(value);
        let advance = start + 2 + end + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Uniform block layout must match `ShadertoyUniforms` in `gpu/uniforms.rs`.
const PRELUDE: &str = r"layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform ShaderParams {
    vec3 _iResolution;
    float _iTime;
    float _iTimeDelta;
    int _iFrame;
    float _iFrameRate;
    float _iSampleRate;
    vec4 _iMouse;
    vec4 _iDate;
    float _iChannelTime[4];
    vec3 _iChannelResolution[4];
} ubo;

// Map ShaderToy names to our UBO fields via macros to avoid name clashes.
#define iResolution ubo._iResolution
#define iTime ubo._iTime
#define iTimeDelta ubo._iTimeDelta
#define iFrame ubo._iFrame
#define iFrameRate ubo._iFrameRate
#define iSampleRate ubo._iSampleRate
#define iMouse ubo._iMouse
#define iDate ubo._iDate
#define iChannelTime ubo._iChannelTime
#define iChannelResolution ubo._iChannelResolution

layout(set = 1, binding = 0) uniform texture2D shaderbot_channel0_texture;
layout(set = 1, binding = 1) uniform sampler shaderbot_channel0_sampler;
layout(set = 1, binding = 2) uniform texture2D shaderbot_channel1_texture;
layout(set = 1, binding = 3) uniform sampler shaderbot_channel1_sampler;
layout(set = 1, binding = 4) uniform texture2D shaderbot_channel2_texture;
layout(set = 1, binding = 5) uniform sampler shaderbot_channel2_sampler;
layout(set = 1, binding = 6) uniform texture2D shaderbot_channel3_texture;
layout(set = 1, binding = 7) uniform sampler shaderbot_channel3_sampler;

#define iChannel0 sampler2D(shaderbot_channel0_texture, shaderbot_channel0_sampler)
#define iChannel1 sampler2D(shaderbot_channel1_texture, shaderbot_channel1_sampler)
#define iChannel2 sampler2D(shaderbot_channel2_texture, shaderbot_channel2_sampler)
#define iChannel3 sampler2D(shaderbot_channel3_texture, shaderbot_channel3_sampler)

vec4 shaderbot_gl_FragCoord;
#define gl_FragCoord shaderbot_gl_FragCoord
";

const ENTRY: &str = r"void main() {
    // Read the hardware builtin, then remap to ShaderToy's bottom-left origin.
    #undef gl_FragCoord
    vec2 builtinFC = vec2(gl_FragCoord.x, gl_FragCoord.y);
    #define gl_FragCoord shaderbot_gl_FragCoord

    vec2 fragCoord = vec2(builtinFC.x, iResolution.y - builtinFC.y);
    shaderbot_gl_FragCoord = vec4(fragCoord, 0.0, 1.0);

    vec4 color = vec4(0.0);
    mainImage(color, fragCoord);
    outColor = vec4(color.rgb, 1.0);
}
";

/// Full-screen triangle covering the viewport.
const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) out vec2 v_uv;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    v_uv = pos * 0.5 + vec2(0.5, 0.5);
    gl_Position = vec4(pos, 0.0, 1.0);
}
";
