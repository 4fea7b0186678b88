//! Element types and the conversion of element counts to byte layouts.

use std::mem::size_of;

use bytemuck::Pod;

use crate::locality_error::LocalityError;
use crate::plan::ByteLayout;

/// Size and name of a plain-old-data element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datatype {
    size: usize,
    name: &'static str,
}

impl Datatype {
    pub fn of<T: Pod>() -> Self {
        Self {
            size: size_of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Raw bytes.
    pub fn byte() -> Self {
        Self::of::<u8>()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Convert per-peer element counts and displacements into bytes.
    pub fn byte_layout(
        &self,
        what: &str,
        counts: &[usize],
        displs: &[usize],
    ) -> Result<ByteLayout, LocalityError> {
        if counts.len() != displs.len() {
            return Err(LocalityError::InvalidArguments(format!(
                "{what}: {} counts but {} displacements",
                counts.len(),
                displs.len()
            )));
        }
        let scale = |v: usize| {
            v.checked_mul(self.size).ok_or_else(|| {
                LocalityError::InvalidArguments(format!(
                    "{what}: {v} elements of {} overflow a byte offset",
                    self.name
                ))
            })
        };
        let layout = ByteLayout {
            counts: counts.iter().map(|&c| scale(c)).collect::<Result<_, _>>()?,
            displs: displs.iter().map(|&d| scale(d)).collect::<Result<_, _>>()?,
        };
        // extent must be representable too
        layout
            .counts
            .iter()
            .zip(&layout.displs)
            .try_for_each(|(c, d)| {
                c.checked_add(*d).map(|_| ()).ok_or_else(|| {
                    LocalityError::InvalidArguments(format!("{what}: displacement overflow"))
                })
            })?;
        Ok(layout)
    }

    /// `T` must have this datatype's size.
    pub fn check_element<T: Pod>(&self, what: &str) -> Result<(), LocalityError> {
        if size_of::<T>() == self.size {
            Ok(())
        } else {
            Err(LocalityError::InvalidArguments(format!(
                "{what} buffer holds {} ({} bytes), request was built for {} ({} bytes)",
                std::any::type_name::<T>(),
                size_of::<T>(),
                self.name,
                self.size
            )))
        }
    }
}

/// `buf_len` bytes must cover every entry of `layout`.
pub fn check_extent(what: &str, layout: &ByteLayout, buf_len: usize) -> Result<(), LocalityError> {
    let extent = layout.extent();
    if extent > buf_len {
        return Err(LocalityError::InvalidArguments(format!(
            "{what} buffer has {buf_len} bytes, counts and displacements reach {extent}"
        )));
    }
    Ok(())
}
