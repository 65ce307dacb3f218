// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

/// Declares a view over a record that the firmware reads and writes in shared memory.
///
/// Each field is given by its byte offset within the record, and optionally the offset one past
/// its end (`name @ 32..96 : TpArray<'a, TpRegisterRw<'a, u8>>`) when the field is an array.
///
/// The optional length becomes the record's [`TpStruct::SIZE`](crate::regions::structured::TpStruct),
/// which allows the record to be placed in a [`TpArray`](crate::regions::structured::TpArray).
///
/// TODO: Validate field offsets against length.
#[macro_export]
macro_rules! tp_struct {
    (
        $(
            $(#[$attr:meta])*
            $vis:vis struct $name:ident<$lifetime:lifetime> $(: $length:literal)? {
                $(
                    $(#[$field_attr:meta])*
                    $field_name:ident @ $field_offset:literal $(..$field_end:literal)? :
                    $($field_type:ident)::+$(<$($field_generics:tt),+ $(,)?>)?
                ),* $(,)?
            }
        )*
    ) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy)]
            $vis struct $name<$lifetime> {
                subregion: $crate::regions::TpSubregion<$lifetime>,
            }

            impl<'a> $crate::regions::BackedByTpSubregion<'a> for $name<'a> {
                fn backed_by(as_subregion: impl $crate::regions::AsTpSubregion<'a>) -> Self {
                    let subregion = $crate::regions::AsTpSubregion::subregion(&as_subregion, ..$($length)?);
                    $name { subregion }
                }
            }

            impl<'a> $crate::regions::AsTpSubregion<'a> for $name<'a> {
                fn as_subregion(&self) -> $crate::regions::TpSubregion<'a> {
                    self.subregion
                }
            }

            $(
                impl $crate::regions::structured::TpStruct for $name<'_> {
                    const SIZE: u64 = $length;
                }
            )?

            $crate::_tp_struct_impl! {
                impl $name<$lifetime> {
                    $(
                        $(#[$field_attr])*
                        $field_name @ $field_offset $(..$field_end)? :
                        $($field_type)::+$(<$($field_generics),+>)?
                    ),*
                }
            }
        )*
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `stpti-hal` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _tp_struct_impl {
    (
        impl $name:ident<$lifetime:lifetime> {
            $(
                $(#[$field_attr:meta])*
                $field_name:ident @ $field_offset:literal $(..$field_end:literal)? :
                $($field_type:ident)::+$(<$($field_generics:tt),+ $(,)?>)?
            ),* $(,)?
        }
    ) => {
        impl ::std::fmt::Debug for $name<'_> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let mut debug_struct = f.debug_struct(::std::stringify!($name));
                $( debug_struct.field(::std::stringify!($field_name), &self.$field_name()); )*
                debug_struct.finish()
            }
        }

        impl<$lifetime> $name<$lifetime> {
            $(
                $(#[$field_attr])*
                pub fn $field_name(&self) -> $($field_type)::+$(<$($field_generics),+>)? {
                    let subregion = $crate::regions::AsTpSubregion::subregion(
                        self,
                        $field_offset..$crate::_tp_field_end!($($field_end)?),
                    );
                    $crate::regions::BackedByTpSubregion::backed_by(subregion)
                }
            )*
        }
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `stpti-hal` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _tp_field_end {
    () => {
        u64::MAX
    };
    ($end:literal) => {
        $end
    };
}

/* ---------------------------------------------------------------------------------------------- */
