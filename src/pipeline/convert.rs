//! Format conversion on retrieval.
//!
//! The source image is decoded up front; a decode failure is returned
//! directly. Encoding then runs on a blocking thread that writes into a pipe
//! whose read end is handed back immediately, so the caller can start
//! streaming before the encoder is done. The encoder's outcome arrives on a
//! [`Completion`].

use super::PIPE_CAPACITY;
use crate::codec::{Codec, CodecRegistry};
use crate::models::{Image, ImageStream};
use crate::{Error, Result};
use image::DynamicImage;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error};

/// Outcome of a background encode, delivered at most once.
///
/// Dropping it without waiting is allowed; the encoder still runs to
/// completion and its result is discarded.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Completion {
    fn channel() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that has already succeeded.
    pub fn ready() -> Self {
        let (tx, completion) = Self::channel();
        let _ = tx.send(Ok(()));
        completion
    }

    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::Invariant(
                "encoder exited without reporting".to_string(),
            ))
        })
    }

    /// Non-blocking check; `None` while encoding is still running.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Invariant(
                "encoder exited without reporting".to_string(),
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Converter {
    registry: Arc<CodecRegistry>,
}

impl Converter {
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        Self { registry }
    }

    pub fn target(&self, token: &str) -> Result<&Codec> {
        self.registry.lookup(token)
    }

    /// Re-encode `image` as `target` (a token such as `png` or `jpg`).
    ///
    /// When the image already has the target content type it is returned
    /// untouched with a completed [`Completion`].
    pub async fn convert(&self, image: Image, target: &str) -> Result<(Image, Completion)> {
        let codec = *self.target(target)?;

        if image.content_type.eq_ignore_ascii_case(codec.content_type) {
            debug!("{:?} is already {}, passing through", image.id, codec.name);
            return Ok((image, Completion::ready()));
        }

        let Image {
            id,
            content_type,
            data,
        } = image;

        let source = SyncIoBridge::new(data);
        let registry = Arc::clone(&self.registry);
        let pixels = tokio::task::spawn_blocking(move || {
            registry
                .detect_and_decode(source)
                .map(|(pixels, _)| pixels)
        })
        .await
        .map_err(|e| Error::Invariant(format!("Decode task join error: {}", e)))?
        .map_err(|e| {
            error!(
                "unable to decode {} image {:?}: {}",
                content_type, id, e
            );
            e
        })?;

        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, completion) = Completion::channel();
        let sink = SyncIoBridge::new(writer);
        tokio::task::spawn_blocking(move || encode(codec, pixels, sink, tx));

        debug!(
            "Converting {:?} from {} to {}",
            id, content_type, codec.content_type
        );
        let data: ImageStream = Box::pin(reader);
        Ok((
            Image {
                id,
                content_type: codec.content_type.to_string(),
                data,
            },
            completion,
        ))
    }
}

fn encode(
    codec: Codec,
    pixels: DynamicImage,
    mut sink: SyncIoBridge<DuplexStream>,
    tx: oneshot::Sender<Result<()>>,
) {
    let result = {
        let mut out = BufWriter::new(&mut sink);
        codec
            .encode(&pixels, &mut out)
            .and_then(|()| out.flush().map_err(Error::from))
    };

    if let Err(e) = &result {
        debug!("unable to encode {} image: {}", codec.name, e);
    }
    // The receiver may have been dropped; nobody is waiting then.
    let _ = tx.send(result);

    if let Err(e) = sink.shutdown() {
        debug!("error closing pipe: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn encoded(codec: &Codec) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            20,
            10,
            image::Rgba([255, 128, 0, 255]),
        ));
        let mut bytes = Vec::new();
        codec.encode(&image, &mut bytes).unwrap();
        bytes
    }

    fn stored(codec: &Codec) -> Image {
        Image::stored(
            "abc",
            codec.content_type,
            Box::pin(Cursor::new(encoded(codec))),
        )
    }

    fn converter() -> Converter {
        Converter::new(Arc::new(CodecRegistry::default()))
    }

    #[tokio::test]
    async fn test_convert_png_to_gif() {
        let (image, completion) = converter().convert(stored(&Codec::png()), "gif").await.unwrap();

        assert_eq!(image.id.as_deref(), Some("abc"));
        assert_eq!(image.content_type, "image/gif");

        let bytes = image.into_bytes().await.unwrap();
        completion.wait().await.unwrap();

        let registry = CodecRegistry::default();
        let (decoded, codec) = registry.detect_and_decode(Cursor::new(bytes)).unwrap();
        assert_eq!(codec.name, "gif");
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
    }

    #[tokio::test]
    async fn test_convert_same_format_passes_through() {
        let original = encoded(&Codec::jpeg());
        let image = Image::stored("abc", "image/jpeg", Box::pin(Cursor::new(original.clone())));

        let (image, mut completion) = converter().convert(image, "jpg").await.unwrap();

        assert!(matches!(completion.try_result(), Some(Ok(()))));
        assert_eq!(image.into_bytes().await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_convert_unsupported_target() {
        let err = converter()
            .convert(stored(&Codec::png()), "tiff")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_convert_decode_failure_is_synchronous() {
        let image = Image::stored(
            "abc",
            "image/png",
            Box::pin(Cursor::new(b"\x89PNG\r\n\x1a\nnot really".to_vec())),
        );

        let result = converter().convert(image, "gif").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_convert_encode_failure_reported_on_completion() {
        fn half_then_fail(_: &DynamicImage, w: &mut dyn Write) -> image::ImageResult<()> {
            w.write_all(b"GIF89a")?;
            Err(image::ImageError::IoError(std::io::Error::other(
                "encoder gave up",
            )))
        }

        let registry = CodecRegistry::new(vec![
            Codec::png(),
            Codec::gif().with_encoder(half_then_fail),
        ]);
        let converter = Converter::new(Arc::new(registry));

        let (mut image, completion) = converter.convert(stored(&Codec::png()), "gif").await.unwrap();

        let mut bytes = Vec::new();
        image.data.read_to_end(&mut bytes).await.unwrap();
        assert!(bytes.len() <= 6);

        let err = completion.wait().await.unwrap_err();
        assert!(err.to_string().contains("encoder gave up"));
    }

    #[tokio::test]
    async fn test_convert_bytes_readable_before_encoder_finishes() {
        use std::sync::{Condvar, Mutex};

        static GATE: (Mutex<bool>, Condvar) = (Mutex::new(false), Condvar::new());

        fn gated(_: &DynamicImage, w: &mut dyn Write) -> image::ImageResult<()> {
            w.write_all(b"GIF89a")?;
            w.flush()?;
            let (open, cvar) = &GATE;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            w.write_all(b"rest")?;
            Ok(())
        }

        let registry = CodecRegistry::new(vec![Codec::png(), Codec::gif().with_encoder(gated)]);
        let converter = Converter::new(Arc::new(registry));
        let (mut image, mut completion) =
            converter.convert(stored(&Codec::png()), "gif").await.unwrap();

        let mut head = [0u8; 6];
        image.data.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"GIF89a");
        assert!(completion.try_result().is_none());

        {
            let (open, cvar) = &GATE;
            *open.lock().unwrap() = true;
            cvar.notify_all();
        }

        let mut rest = Vec::new();
        image.data.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
        completion.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_convert_reader_dropped_reports_error() {
        // More output than the pipe holds, so the encoder cannot finish
        // without a reader.
        fn oversized(_: &DynamicImage, w: &mut dyn Write) -> image::ImageResult<()> {
            w.write_all(&vec![0u8; 4 * PIPE_CAPACITY])?;
            Ok(())
        }

        let registry =
            CodecRegistry::new(vec![Codec::png(), Codec::gif().with_encoder(oversized)]);
        let converter = Converter::new(Arc::new(registry));
        let (image, completion) = converter.convert(stored(&Codec::png()), "gif").await.unwrap();
        drop(image);

        let err = completion.wait().await.unwrap_err();
        assert!(matches!(err, Error::Image(_) | Error::Stream(_)), "{:?}", err);
    }
}
