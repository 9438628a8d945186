//! Operand storage handed between a [`Backend`](crate::Backend) and its
//! callers.

/// `f32` operand or norm vector owned by a backend.
///
/// The CPU backend keeps only the host vector. The CUDA backend keeps the
/// device allocation and, while it is in sync, a host mirror; a buffer whose
/// device side was written by a copy may drop its mirror.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) host_data: Option<Vec<f32>>,
    pub(crate) len: usize,
    #[cfg(feature = "cuda")]
    pub(crate) cuda_slice: Option<cudarc::driver::CudaSlice<f32>>,
}

impl Buffer {
    pub(crate) fn from_host(data: Vec<f32>) -> Self {
        Self {
            len: data.len(),
            host_data: Some(data),
            #[cfg(feature = "cuda")]
            cuda_slice: None,
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn from_cuda(
        host_data: Option<Vec<f32>>,
        cuda_slice: cudarc::driver::CudaSlice<f32>,
        len: usize,
    ) -> Self {
        Self {
            host_data,
            len,
            cuda_slice: Some(cuda_slice),
        }
    }

    /// Element count, whether or not a host mirror is present.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host view of the data; `None` for device-only buffers, which must be
    /// read through `Backend::read_buffer`.
    pub fn as_host_slice(&self) -> Option<&[f32]> {
        self.host_data.as_deref()
    }
}
