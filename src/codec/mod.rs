//! Image codecs and format detection
//!
//! A [`CodecRegistry`] maps format tokens (`png`, `jpeg`, `gif`) to their
//! encoders and decodes any registered format from its magic bytes. The
//! registry is built once at startup and only read afterwards.

pub mod stream;

pub use stream::{ForwardSeek, TeeReader};

use crate::{Error, Result};
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, ImageResult};
use std::io::{BufReader, Cursor, Read, Write};

/// Number of leading bytes inspected when sniffing a format.
pub const SNIFF_LEN: usize = 32;

pub type EncodeFn = fn(&DynamicImage, &mut dyn Write) -> ImageResult<()>;

/// Encode capability for one raster format.
#[derive(Clone, Copy)]
pub struct Codec {
    pub name: &'static str,
    pub content_type: &'static str,
    pub format: ImageFormat,
    aliases: &'static [&'static str],
    encoder: EncodeFn,
}

impl Codec {
    pub const fn new(
        name: &'static str,
        content_type: &'static str,
        format: ImageFormat,
        encoder: EncodeFn,
    ) -> Self {
        Self {
            name,
            content_type,
            format,
            aliases: &[],
            encoder,
        }
    }

    pub const fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    /// Swap the encoder, keeping the format identity.
    pub const fn with_encoder(mut self, encoder: EncodeFn) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn png() -> Self {
        Self::new("png", "image/png", ImageFormat::Png, encode_png)
    }

    pub fn jpeg() -> Self {
        Self::new("jpeg", "image/jpeg", ImageFormat::Jpeg, encode_jpeg).with_aliases(&["jpg"])
    }

    pub fn gif() -> Self {
        Self::new("gif", "image/gif", ImageFormat::Gif, encode_gif)
    }

    pub fn encode(&self, image: &DynamicImage, writer: &mut dyn Write) -> Result<()> {
        (self.encoder)(image, writer)?;
        Ok(())
    }

    fn answers_to(&self, token: &str) -> bool {
        self.name.eq_ignore_ascii_case(token)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(token))
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .finish()
    }
}

fn encode_png(image: &DynamicImage, writer: &mut dyn Write) -> ImageResult<()> {
    image.write_with_encoder(PngEncoder::new(writer))
}

// JPEG has no alpha channel.
fn encode_jpeg(image: &DynamicImage, writer: &mut dyn Write) -> ImageResult<()> {
    DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(JpegEncoder::new(writer))
}

fn encode_gif(image: &DynamicImage, writer: &mut dyn Write) -> ImageResult<()> {
    let mut encoder = GifEncoder::new(writer);
    encoder.encode_frame(image::Frame::new(image.to_rgba8()))?;
    // Trailer is written on drop.
    drop(encoder);
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: Vec<Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new(vec![Codec::png(), Codec::jpeg(), Codec::gif()])
    }
}

impl CodecRegistry {
    pub fn new(codecs: Vec<Codec>) -> Self {
        Self { codecs }
    }

    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    /// Find the codec for a conversion target such as `png` or `jpg`.
    pub fn lookup(&self, token: &str) -> Result<&Codec> {
        self.codecs
            .iter()
            .find(|c| c.answers_to(token))
            .ok_or_else(|| Error::UnsupportedFormat(token.to_string()))
    }

    pub fn by_content_type(&self, content_type: &str) -> Option<&Codec> {
        self.codecs
            .iter()
            .find(|c| c.content_type.eq_ignore_ascii_case(content_type))
    }

    /// Identify the format from the leading bytes of a payload.
    pub fn sniff(&self, prefix: &[u8]) -> Result<&Codec> {
        let format = image::guess_format(prefix).map_err(|_| Error::NotAnImage)?;
        self.codecs
            .iter()
            .find(|c| c.format == format)
            .ok_or(Error::NotAnImage)
    }

    /// Decode a whole image of any registered format from a forward-only reader.
    ///
    /// PNG and GIF are decoded incrementally. The JPEG decoder reads its
    /// whole compressed input into memory before decoding.
    pub fn detect_and_decode<R: Read>(&self, mut reader: R) -> Result<(DynamicImage, &Codec)> {
        let mut prefix = Vec::with_capacity(SNIFF_LEN);
        reader
            .by_ref()
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut prefix)?;
        let codec = self.sniff(&prefix)?;

        let stream = ForwardSeek::new(BufReader::new(Cursor::new(prefix).chain(reader)));
        let image = ImageReader::with_format(stream, codec.format).decode()?;
        tracing::debug!(
            "decoded {} image {}x{}",
            codec.name,
            image.width(),
            image.height()
        );
        Ok((image, codec))
    }
}
