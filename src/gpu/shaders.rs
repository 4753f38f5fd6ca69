//! RGB→YUV fragment shaders
//!
//! One vertex shader and seven fragment shaders cover every output layout:
//! a plain copy, the three packed layouts (tile-packed 4:2:0, packed-word
//! 4:2:2, packed 4:4:4), and the three 4:2:0 main/auxiliary-view variants
//! used for dual-stream 4:4:4. Each conversion shader samples one
//! `sampler2D` and applies a 3x4 matrix handed over as three `vec4`
//! uniforms (`ymath`/`umath`/`vmath`), bias in `.w`.
//!
//! All programs are compiled once at startup and keep the BT.601
//! studio-range matrix until a caller installs another one.

use glow::HasContext;

use super::GpuError;

/// 3x4 RGB→YUV matrix, one row per output component, bias in `.w`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix {
    pub ymath: [f32; 4],
    pub umath: [f32; 4],
    pub vmath: [f32; 4],
}

/// BT.601 studio range (legacy bitmap codecs).
pub const MATRIX_BT601_STUDIO: ColorMatrix = ColorMatrix {
    ymath: [66.0 / 256.0, 129.0 / 256.0, 25.0 / 256.0, 16.0 / 256.0],
    umath: [-38.0 / 256.0, -74.0 / 256.0, 112.0 / 256.0, 128.0 / 256.0],
    vmath: [112.0 / 256.0, -94.0 / 256.0, -18.0 / 256.0, 128.0 / 256.0],
};

/// BT.709 full range (gfx H.264).
pub const MATRIX_BT709_FULL: ColorMatrix = ColorMatrix {
    ymath: [54.0 / 256.0, 183.0 / 256.0, 18.0 / 256.0, 0.0],
    umath: [-29.0 / 256.0, -99.0 / 256.0, 128.0 / 256.0, 128.0 / 256.0],
    vmath: [128.0 / 256.0, -116.0 / 256.0, -12.0 / 256.0, 128.0 / 256.0],
};

/// Progressive-wavelet variant (0.299/0.587/0.114 luma, symmetric chroma).
pub const MATRIX_RFX_PROGRESSIVE: ColorMatrix = ColorMatrix {
    ymath: [0.299_000, 0.587_000, 0.114_000, 0.0],
    umath: [-0.168_935, -0.331_665, 0.500_590, 0.5],
    vmath: [0.499_830, -0.418_531, -0.081_282, 0.5],
};

/// Index into the compiled shader set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ShaderKind {
    Copy = 0,
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
    Yuv420MainView = 4,
    Yuv420AuxView = 5,
    Yuv420AuxViewV2 = 6,
}

pub const SHADER_COUNT: usize = 7;

const ALL_KINDS: [ShaderKind; SHADER_COUNT] = [
    ShaderKind::Copy,
    ShaderKind::Yuv420,
    ShaderKind::Yuv422,
    ShaderKind::Yuv444,
    ShaderKind::Yuv420MainView,
    ShaderKind::Yuv420AuxView,
    ShaderKind::Yuv420AuxViewV2,
];

const VS: &str = "\
attribute vec4 position;
void main(void)
{
    gl_Position = vec4(position.xy, 0.0, 1.0);
}
";

const FS_COPY: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
void main(void)
{
    gl_FragColor = texture2D(tex, gl_FragCoord.xy / tex_size);
}
";

/// Tile-packed 4:2:0: Y plane 1:1 on the top H rows, then U in even and V in
/// odd columns, each averaged over a 2x2 source block.
const FS_RGB_TO_YUV420: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
uniform vec4 ymath;
uniform vec4 umath;
uniform vec4 vmath;
void main(void)
{
    vec4 pix;
    float x;
    float y;
    x = gl_FragCoord.x;
    y = gl_FragCoord.y;
    if (y < tex_size.y)
    {
        pix = texture2D(tex, vec2(x, y) / tex_size);
        pix.a = 1.0;
        pix = vec4(clamp(dot(ymath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
        gl_FragColor = pix;
    }
    else
    {
        y = floor(y - tex_size.y) * 2.0 + 0.5;
        if (mod(x, 2.0) < 1.0)
        {
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix += texture2D(tex, vec2(x + 1.0, y) / tex_size);
            pix += texture2D(tex, vec2(x, y + 1.0) / tex_size);
            pix += texture2D(tex, vec2(x + 1.0, y + 1.0) / tex_size);
            pix /= 4.0;
            pix.a = 1.0;
            pix = vec4(clamp(dot(umath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
        else
        {
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix += texture2D(tex, vec2(x - 1.0, y) / tex_size);
            pix += texture2D(tex, vec2(x, y + 1.0) / tex_size);
            pix += texture2D(tex, vec2(x - 1.0, y + 1.0) / tex_size);
            pix /= 4.0;
            pix.a = 1.0;
            pix = vec4(clamp(dot(vmath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
    }
}
";

/// Packed-word 4:2:2: each output texel carries [Y0 U Y1 V] for two adjacent
/// source pixels.
const FS_RGB_TO_YUV422: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
uniform vec4 ymath;
uniform vec4 umath;
uniform vec4 vmath;
void main(void)
{
    vec4 pix;
    vec4 pix1;
    vec4 pixs;
    float x;
    float y;
    x = gl_FragCoord.x;
    x = floor(x) * 2.0 + 0.5;
    y = gl_FragCoord.y;
    pix = texture2D(tex, vec2(x, y) / tex_size);
    pix1 = texture2D(tex, vec2(x + 1.0, y) / tex_size);
    pixs = (pix + pix1) / 2.0;
    pix.a = 1.0;
    pix1.a = 1.0;
    pixs.a = 1.0;
    pix.r = dot(ymath, pix);
    pix.g = dot(umath, pixs);
    pix.b = dot(ymath, pix1);
    pix.a = dot(vmath, pixs);
    gl_FragColor = clamp(pix, 0.0, 1.0);
}
";

/// Packed 4:4:4, components ordered V,U,Y,A in memory.
const FS_RGB_TO_YUV444: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
uniform vec4 ymath;
uniform vec4 umath;
uniform vec4 vmath;
void main(void)
{
    vec4 pix;
    pix = texture2D(tex, gl_FragCoord.xy / tex_size);
    pix.a = 1.0;
    pix = vec4(dot(vmath, pix), dot(umath, pix), dot(ymath, pix), 1.0);
    gl_FragColor = clamp(pix, 0.0, 1.0);
}
";

/// Main view of the dual-stream 4:2:0 pair: Y 1:1, chroma from even rows and
/// columns only.
const FS_RGB_TO_YUV420_MV: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
uniform vec4 ymath;
uniform vec4 umath;
uniform vec4 vmath;
void main(void)
{
    vec4 pix;
    float x;
    float y;
    x = gl_FragCoord.x;
    y = gl_FragCoord.y;
    if (y < tex_size.y)
    {
        pix = texture2D(tex, vec2(x, y) / tex_size);
        pix.a = 1.0;
        pix = vec4(clamp(dot(ymath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
        gl_FragColor = pix;
    }
    else
    {
        y = floor(y - tex_size.y) * 2.0 + 0.5;
        if (mod(x, 2.0) < 1.0)
        {
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(umath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
        else
        {
            pix = texture2D(tex, vec2(x - 1.0, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(vmath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
    }
}
";

/// Auxiliary view, 8-line interleave of the chroma the main view dropped.
const FS_RGB_TO_YUV420_AV: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
uniform vec4 umath;
uniform vec4 vmath;
void main(void)
{
    vec4 pix;
    float x;
    float y;
    float y1;
    x = gl_FragCoord.x;
    y = gl_FragCoord.y;
    if (y < tex_size.y)
    {
        y1 = mod(y, 16.0);
        if (y1 < 8.0)
        {
            y = floor(y / 16.0) * 8.0 + y1;
            y = floor(y) * 2.0 + 1.5;
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(umath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
        else
        {
            y = floor(y / 16.0) * 8.0 + (y1 - 8.0);
            y = floor(y) * 2.0 + 1.5;
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(vmath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
    }
    else
    {
        y = floor(y - tex_size.y) * 2.0 + 0.5;
        if (mod(x, 2.0) < 1.0)
        {
            pix = texture2D(tex, vec2(x + 1.0, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(umath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
        else
        {
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(vmath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
    }
}
";

/// Auxiliary view, side-by-side U|V packing.
const FS_RGB_TO_YUV420_AV_V2: &str = "\
uniform sampler2D tex;
uniform vec2 tex_size;
uniform vec4 umath;
uniform vec4 vmath;
void main(void)
{
    vec4 pix;
    float x;
    float y;
    float x1;
    x = gl_FragCoord.x;
    y = gl_FragCoord.y;
    x1 = tex_size.x / 2.0;
    if (y < tex_size.y)
    {
        if (x < x1)
        {
            x = floor(x) * 2.0 + 1.5;
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(umath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
        else
        {
            x = floor(x - x1) * 2.0 + 1.5;
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(vmath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
    }
    else
    {
        y = floor(y - tex_size.y) * 2.0 + 1.5;
        if (x < x1)
        {
            x = floor(x) * 2.0 + 0.5;
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(umath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
        else
        {
            x = floor(x - x1) * 2.0 + 0.5;
            pix = texture2D(tex, vec2(x, y) / tex_size);
            pix.a = 1.0;
            pix = vec4(clamp(dot(vmath, pix), 0.0, 1.0), 0.0, 0.0, 1.0);
            gl_FragColor = pix;
        }
    }
}
";

fn fragment_source(kind: ShaderKind) -> &'static str {
    match kind {
        ShaderKind::Copy => FS_COPY,
        ShaderKind::Yuv420 => FS_RGB_TO_YUV420,
        ShaderKind::Yuv422 => FS_RGB_TO_YUV422,
        ShaderKind::Yuv444 => FS_RGB_TO_YUV444,
        ShaderKind::Yuv420MainView => FS_RGB_TO_YUV420_MV,
        ShaderKind::Yuv420AuxView => FS_RGB_TO_YUV420_AV,
        ShaderKind::Yuv420AuxViewV2 => FS_RGB_TO_YUV420_AV_V2,
    }
}

/// One linked conversion program with its uniform locations.
pub struct Shader {
    pub program: glow::Program,
    pub tex_size: Option<glow::UniformLocation>,
    ymath: Option<glow::UniformLocation>,
    umath: Option<glow::UniformLocation>,
    vmath: Option<glow::UniformLocation>,
}

/// All seven programs, indexed by [`ShaderKind`].
pub struct ShaderSet {
    shaders: Vec<Shader>,
}

impl ShaderSet {
    /// Compile and link everything, installing the BT.601 default matrix.
    pub fn compile(gl: &glow::Context) -> Result<Self, GpuError> {
        let mut shaders = Vec::with_capacity(SHADER_COUNT);
        for kind in ALL_KINDS {
            let shader = compile_one(gl, VS, fragment_source(kind))?;
            // SAFETY: program was linked above and the context is current.
            unsafe {
                gl.use_program(Some(shader.program));
                if let Some(loc) = gl.get_uniform_location(shader.program, "tex") {
                    gl.uniform_1_i32(Some(&loc), 0);
                }
                set_matrix_uniforms(gl, &shader, &MATRIX_BT601_STUDIO);
                gl.use_program(None);
            }
            shaders.push(shader);
        }
        Ok(Self { shaders })
    }

    pub fn get(&self, kind: ShaderKind) -> &Shader {
        &self.shaders[kind as usize]
    }

    /// Replace the conversion matrix of one program.
    pub fn set_matrix(&self, gl: &glow::Context, kind: ShaderKind, matrix: &ColorMatrix) {
        let shader = self.get(kind);
        // SAFETY: program is linked and the context is current.
        unsafe {
            gl.use_program(Some(shader.program));
            set_matrix_uniforms(gl, shader, matrix);
            gl.use_program(None);
        }
    }

    pub fn destroy(&self, gl: &glow::Context) {
        for shader in &self.shaders {
            // SAFETY: programs were created from this context.
            unsafe {
                gl.delete_program(shader.program);
            }
        }
    }
}

unsafe fn set_matrix_uniforms(gl: &glow::Context, shader: &Shader, matrix: &ColorMatrix) {
    // SAFETY: caller holds the program bound on the current context.
    unsafe {
        if let Some(loc) = shader.ymath.as_ref() {
            gl.uniform_4_f32_slice(Some(loc), &matrix.ymath);
        }
        if let Some(loc) = shader.umath.as_ref() {
            gl.uniform_4_f32_slice(Some(loc), &matrix.umath);
        }
        if let Some(loc) = shader.vmath.as_ref() {
            gl.uniform_4_f32_slice(Some(loc), &matrix.vmath);
        }
    }
}

fn compile_one(gl: &glow::Context, vs: &str, fs: &str) -> Result<Shader, GpuError> {
    // SAFETY: GL context is current for the whole compile/link sequence.
    unsafe {
        let program = gl.create_program().map_err(GpuError::Gl)?;

        let mut stages = Vec::with_capacity(2);
        for (stage, source) in [(glow::VERTEX_SHADER, vs), (glow::FRAGMENT_SHADER, fs)] {
            let shader = gl.create_shader(stage).map_err(GpuError::Gl)?;
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                gl.delete_program(program);
                return Err(GpuError::Shader { log });
            }
            gl.attach_shader(program, shader);
            stages.push(shader);
        }

        gl.link_program(program);
        let linked = gl.get_program_link_status(program);
        for shader in stages {
            gl.detach_shader(program, shader);
            gl.delete_shader(shader);
        }
        if !linked {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            return Err(GpuError::Shader { log });
        }

        Ok(Shader {
            tex_size: gl.get_uniform_location(program, "tex_size"),
            ymath: gl.get_uniform_location(program, "ymath"),
            umath: gl.get_uniform_location(program, "umath"),
            vmath: gl.get_uniform_location(program, "vmath"),
            program,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrices_are_rgb_to_yuv_shaped() {
        // luma rows sum to (nearly) the white level, chroma rows to zero
        for m in [MATRIX_BT601_STUDIO, MATRIX_BT709_FULL, MATRIX_RFX_PROGRESSIVE] {
            let y_sum: f32 = m.ymath[..3].iter().sum();
            let u_sum: f32 = m.umath[..3].iter().sum();
            let v_sum: f32 = m.vmath[..3].iter().sum();
            assert!(y_sum > 0.8 && y_sum < 1.001, "luma weights {y_sum}");
            assert!(u_sum.abs() < 0.01, "chroma u weights {u_sum}");
            assert!(v_sum.abs() < 0.01, "chroma v weights {v_sum}");
        }
    }

    #[test]
    fn progressive_matrix_luma() {
        assert_eq!(MATRIX_RFX_PROGRESSIVE.ymath[0], 0.299);
        assert_eq!(MATRIX_RFX_PROGRESSIVE.ymath[1], 0.587);
        assert_eq!(MATRIX_RFX_PROGRESSIVE.ymath[2], 0.114);
    }

    #[test]
    fn aux_view_shaders_have_no_luma_uniform() {
        assert!(!FS_RGB_TO_YUV420_AV.contains("ymath"));
        assert!(!FS_RGB_TO_YUV420_AV_V2.contains("ymath"));
    }
}
