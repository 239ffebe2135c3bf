//! Typed read views over generic persistent objects.
//!
//! `typed_entity!` declares a borrowed view type with one getter per
//! attribute, so callers do not pass attribute names as strings:
//!
//! ```
//! contentmap_core::typed_entity! {
//!     pub struct BookView: "Book" {
//!         title: text => "title",
//!         created: integer => "created",
//!     }
//! }
//! ```

/// Declares a typed, read-only view of a `PersistentObject`.
///
/// Getter kinds are `text`, `integer` and `real`.
#[macro_export]
macro_rules! typed_entity {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $type_name:literal {
            $($getter:ident : $kind:ident => $attribute:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name<'a> {
            object: &'a $crate::model::object::PersistentObject,
        }

        impl<'a> $name<'a> {
            pub const TYPE_NAME: &'static str = $type_name;

            /// Wraps `object`, rejecting objects of another type.
            pub fn wrap(
                object: &'a $crate::model::object::PersistentObject,
            ) -> $crate::error::PersistenceResult<Self> {
                if object.type_name() != $type_name {
                    return Err($crate::error::PersistenceError::InvalidData(format!(
                        "`{}` is not a `{}`",
                        object.oid(),
                        $type_name
                    )));
                }
                Ok(Self { object })
            }

            pub fn oid(&self) -> &$crate::model::oid::ObjectId {
                self.object.oid()
            }

            pub fn object(&self) -> &'a $crate::model::object::PersistentObject {
                self.object
            }

            $($crate::typed_entity!(@getter $getter $kind $attribute);)*
        }
    };
    (@getter $getter:ident text $attribute:literal) => {
        pub fn $getter(&self) -> $crate::error::PersistenceResult<Option<&str>> {
            self.object.get_str($attribute)
        }
    };
    (@getter $getter:ident integer $attribute:literal) => {
        pub fn $getter(&self) -> $crate::error::PersistenceResult<Option<i64>> {
            self.object.get_i64($attribute)
        }
    };
    (@getter $getter:ident real $attribute:literal) => {
        pub fn $getter(&self) -> $crate::error::PersistenceResult<Option<f64>> {
            self.object.get_f64($attribute)
        }
    };
}
