pub mod files;
pub mod graphql;
pub mod metafields;
pub mod rest;
pub mod staged;

pub use files::{CreateSlot, FileCreateInput};
pub use graphql::{RequestError, ShopifyClient, UserError};
pub use rest::ProductImage;
pub use staged::StagedPayload;
