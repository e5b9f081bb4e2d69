use super::HandlerError;
use crate::environments::adapters::Registry;
use crate::environments::domain::Image;

/// Fails with [`HandlerError::ImageNotFound`] unless `tag` is known.
pub fn image_exists<'r, G>(registry: &'r mut G, tag: &str) -> Result<&'r Image, HandlerError>
where
    G: Registry,
{
    registry
        .find(tag)?
        .ok_or_else(|| HandlerError::ImageNotFound(tag.to_string()))
}
