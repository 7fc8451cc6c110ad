use crate::config::ImageLimits;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::ZlibDecoder;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashSet;
use std::io::Read;
use tracing::debug;

/// An embedded page image, ready to be inlined as a data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page: u32,
    /// 1-based position of the image among the page's image XObjects.
    pub index: usize,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl PageImage {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn to_markdown(&self) -> String {
        format!(
            "![Page {} Image {}](data:{};base64,{})",
            self.page,
            self.index,
            self.mime_type,
            STANDARD.encode(&self.data)
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageImageExtractor {
    limits: ImageLimits,
}

impl PageImageExtractor {
    pub fn new(limits: ImageLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ImageLimits {
        self.limits
    }

    /// Images on one page that fit the configured limits. `seen` carries image object ids
    /// across pages so an image shared by several pages is only emitted the first time.
    pub fn extract(
        &self,
        document: &Document,
        page: u32,
        page_id: ObjectId,
        seen: &mut HashSet<ObjectId>,
    ) -> Vec<PageImage> {
        let mut images = Vec::new();

        for (position, (object_id, stream)) in image_xobjects(document, page_id).into_iter().enumerate() {
            let index = position + 1;
            if self.limits.max_per_page > 0 && index > self.limits.max_per_page {
                debug!(page, limit = self.limits.max_per_page, "image limit reached for page");
                break;
            }

            if !seen.insert(object_id) {
                debug!(page, ?object_id, "skipping image already captured on an earlier page");
                continue;
            }

            let (width, height) = dimensions(stream);
            let pixels = u64::from(width) * u64::from(height);
            if pixels > self.limits.max_pixels {
                debug!(page, index, pixels, "skipping image over the pixel limit");
                continue;
            }

            let (data, mime_type) = match decode_image(stream, width, height) {
                Ok(decoded) => decoded,
                Err(reason) => {
                    debug!(page, index, %reason, "skipping undecodable image");
                    continue;
                }
            };

            if data.len() > self.limits.max_bytes {
                debug!(page, index, bytes = data.len(), "skipping image over the byte limit");
                continue;
            }

            images.push(PageImage {
                page,
                index,
                mime_type,
                width,
                height,
                data,
            });
        }

        images
    }

    /// The page's largest decodable image within the size limits. Scanned pages are a single
    /// full-page image, so this is what gets handed to OCR.
    pub fn largest_raster(&self, document: &Document, page: u32, page_id: ObjectId) -> Option<PageImage> {
        image_xobjects(document, page_id)
            .into_iter()
            .enumerate()
            .filter_map(|(position, (_, stream))| {
                let index = position + 1;
                let (width, height) = dimensions(stream);
                let pixels = u64::from(width) * u64::from(height);
                if pixels > self.limits.max_pixels {
                    debug!(page, index, pixels, "raster over the pixel limit, not used for OCR");
                    return None;
                }

                let (data, mime_type) = decode_image(stream, width, height).ok()?;
                if data.len() > self.limits.max_bytes {
                    debug!(page, index, bytes = data.len(), "raster over the byte limit, not used for OCR");
                    return None;
                }

                Some(PageImage {
                    page,
                    index,
                    mime_type,
                    width,
                    height,
                    data,
                })
            })
            .max_by_key(PageImage::pixels)
    }
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Resources apply to a page either directly or through the nearest ancestor that has them.
fn page_resources(document: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = document.get_dictionary(page_id).ok()?;

    // Page trees are shallow; the bound only guards against reference cycles.
    for _ in 0..32 {
        if let Ok(resources) = node.get(b"Resources") {
            return resolve(document, resources)?.as_dict().ok();
        }
        let parent = node.get(b"Parent").and_then(Object::as_reference).ok()?;
        node = document.get_dictionary(parent).ok()?;
    }

    None
}

fn image_xobjects(document: &Document, page_id: ObjectId) -> Vec<(ObjectId, &Stream)> {
    let Some(xobjects) = page_resources(document, page_id)
        .and_then(|resources| resources.get(b"XObject").ok())
        .and_then(|xobjects| resolve(document, xobjects))
        .and_then(|xobjects| xobjects.as_dict().ok())
    else {
        return Vec::new();
    };

    xobjects
        .iter()
        .filter_map(|(_, value)| {
            let object_id = value.as_reference().ok()?;
            let stream = document.get_object(object_id).ok()?.as_stream().ok()?;
            let is_image = stream
                .dict
                .get(b"Subtype")
                .and_then(Object::as_name)
                .is_ok_and(|name| name == b"Image");
            is_image.then_some((object_id, stream))
        })
        .collect()
}

fn dimensions(stream: &Stream) -> (u32, u32) {
    let read = |key: &[u8]| {
        stream
            .dict
            .get(key)
            .and_then(Object::as_i64)
            .map_or(0, |value| u32::try_from(value).unwrap_or(0))
    };
    (read(b"Width"), read(b"Height"))
}

fn filters(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn color_space(stream: &Stream) -> Option<Vec<u8>> {
    match stream.dict.get(b"ColorSpace").ok()? {
        Object::Name(name) => Some(name.clone()),
        Object::Array(items) => items.first()?.as_name().ok().map(<[u8]>::to_vec),
        _ => None,
    }
}

fn decode_image(stream: &Stream, width: u32, height: u32) -> Result<(Vec<u8>, &'static str), String> {
    let filters = filters(stream);
    let has = |name: &[u8]| filters.iter().any(|filter| filter == name);

    if has(b"DCTDecode") {
        Ok((stream.content.clone(), "image/jpeg"))
    } else if has(b"JPXDecode") {
        Ok((stream.content.clone(), "image/jp2"))
    } else if has(b"FlateDecode") {
        decode_flate_image(stream, width, height).map(|png| (png, "image/png"))
    } else {
        Err(format!(
            "unsupported image filter {:?}",
            filters
                .iter()
                .map(|filter| String::from_utf8_lossy(filter).into_owned())
                .collect::<Vec<_>>()
        ))
    }
}

/// Re-encodes Flate-compressed 8-bit samples as PNG.
fn decode_flate_image(stream: &Stream, width: u32, height: u32) -> Result<Vec<u8>, String> {
    if width == 0 || height == 0 {
        return Err("image has no dimensions".to_string());
    }

    let bits = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);
    if bits != 8 {
        return Err(format!("unsupported bits per component {bits}"));
    }

    // No supported color space needs more than four 8-bit channels.
    let pixels = width as usize * height as usize;
    let expected = pixels.saturating_mul(4);
    let mut samples = Vec::new();
    ZlibDecoder::new(stream.content.as_slice())
        .take(expected as u64 + 1)
        .read_to_end(&mut samples)
        .map_err(|error| format!("decompression failed: {error}"))?;
    if samples.len() > expected {
        return Err("decompressed samples exceed the declared dimensions".to_string());
    }

    let channels = match color_space(stream).as_deref() {
        Some(b"DeviceGray") | Some(b"CalGray") => 1,
        Some(b"DeviceRGB") | Some(b"CalRGB") => 3,
        Some(b"DeviceCMYK") => 4,
        // ICC-based and unnamed spaces: infer from the sample count.
        _ => samples.len() / pixels,
    };

    let image = match channels {
        1 => image::GrayImage::from_raw(width, height, samples).map(image::DynamicImage::ImageLuma8),
        3 => image::RgbImage::from_raw(width, height, samples).map(image::DynamicImage::ImageRgb8),
        4 => image::RgbImage::from_raw(width, height, cmyk_to_rgb(&samples))
            .map(image::DynamicImage::ImageRgb8),
        other => return Err(format!("unsupported channel count {other}")),
    }
    .ok_or_else(|| "sample buffer does not match image dimensions".to_string())?;

    let mut png = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|error| format!("png encoding failed: {error}"))?;
    Ok(png)
}

fn cmyk_to_rgb(cmyk: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(cmyk.len() / 4 * 3);
    for pixel in cmyk.chunks_exact(4) {
        let k = 1.0 - f32::from(pixel[3]) / 255.0;
        for channel in &pixel[..3] {
            rgb.push((255.0 * (1.0 - f32::from(*channel) / 255.0) * k) as u8);
        }
    }
    rgb
}
