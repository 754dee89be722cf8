use crate::error::{ChatError, ChatResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use resvg::{tiny_skia, usvg};
use std::path::Path;

/// 渲染尺寸为viewbox的5倍，放大便于人工识别
const RENDER_SCALE: f32 = 5.0;

/// 登录流程中返回的验证码，内容为data-URL编码的SVG。
/// 空字符串表示本次登录不需要验证码。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captcha(String);

impl Captcha {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn available(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 转换为PNG字节
    pub fn to_png(&self) -> ChatResult<Vec<u8>> {
        if self.0.is_empty() {
            return Err(ChatError::Captcha("empty captcha".to_string()));
        }

        // data-URL前缀长度不固定，按第一个逗号切分
        let (prefix, payload) = self
            .0
            .split_once(',')
            .ok_or_else(|| ChatError::Captcha("not a data URL".to_string()))?;

        if !prefix.starts_with("data:image/svg") {
            return Err(ChatError::Captcha(format!(
                "unexpected data URL prefix: {}",
                prefix
            )));
        }

        let decoded = STANDARD
            .decode(payload)
            .map_err(|e| ChatError::Captcha(format!("invalid base64: {}", e)))?;

        let tree = usvg::Tree::from_data(&decoded, &usvg::Options::default())
            .map_err(|e| ChatError::Captcha(format!("invalid svg: {}", e)))?;

        let width = (tree.size().width() * RENDER_SCALE) as u32;
        let height = (tree.size().height() * RENDER_SCALE) as u32;

        let mut pixmap = tiny_skia::Pixmap::new(width, height)
            .ok_or_else(|| ChatError::Captcha("zero-sized svg".to_string()))?;

        resvg::render(
            &tree,
            tiny_skia::Transform::from_scale(RENDER_SCALE, RENDER_SCALE),
            &mut pixmap.as_mut(),
        );

        pixmap
            .encode_png()
            .map_err(|e| ChatError::Captcha(format!("png encode failed: {}", e)))
    }

    /// 转换为PNG并写入磁盘
    pub fn to_file(&self, path: impl AsRef<Path>) -> ChatResult<()> {
        let png = self.to_png()?;
        std::fs::write(path, png)?;
        Ok(())
    }
}
