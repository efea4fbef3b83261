use super::graphql::{RequestError, ShopifyClient};
use crate::transport::Delivery;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use urlencoding::encode;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ProductImageInput<'a> {
    pub src: &'a str,
    pub alt: Option<&'a str>,
}

#[derive(Serialize)]
struct ProductImageBody<'a> {
    image: ProductImageInput<'a>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductImage {
    pub id: u64,
    pub src: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Deserialize)]
struct ProductImageResponse {
    image: ProductImage,
}

impl ShopifyClient {
    /// Attaches an image to a product through the REST surface. The returned
    /// `src` is served immediately, ahead of GraphQL file processing.
    pub async fn attach_product_image(
        &self,
        product_id: &str,
        src: &str,
        alt: Option<&str>,
    ) -> Result<ProductImage, RequestError> {
        let numeric = product_id.rsplit('/').next().unwrap_or(product_id);
        if numeric.is_empty() {
            return Err(RequestError::Protocol("empty product id".into()));
        }
        let path = format!("products/{}/images.json", encode(numeric));
        let response: ProductImageResponse = self
            .rest_post(
                "product_image_attach",
                Delivery::AtMostOnce,
                &path,
                &ProductImageBody {
                    image: ProductImageInput { src, alt },
                },
            )
            .await?;
        Ok(response.image)
    }
}
