//! OpenCL типы данных

#![allow(non_camel_case_types)]

pub type cl_platform_id = *mut std::ffi::c_void;
pub type cl_device_id = *mut std::ffi::c_void;
pub type cl_context = *mut std::ffi::c_void;
pub type cl_command_queue = *mut std::ffi::c_void;
pub type cl_program = *mut std::ffi::c_void;
pub type cl_kernel = *mut std::ffi::c_void;
pub type cl_mem = *mut std::ffi::c_void;
pub type cl_event = *mut std::ffi::c_void;
pub type cl_platform_info = u32;
pub type cl_device_info = u32;
pub type cl_device_type = u64;
pub type cl_int = i32;
pub type cl_uint = u32;
pub type cl_bool = u32;
pub type cl_ulong = u64;
pub type cl_context_properties = isize;
pub type cl_command_queue_properties = u64;
pub type cl_mem_flags = u64;
pub type cl_program_build_info = u32;

// Константы OpenCL
pub const CL_SUCCESS: cl_int = 0;
pub const CL_DEVICE_NOT_FOUND: cl_int = -1;
pub const CL_PLATFORM_NOT_FOUND_KHR: cl_int = -1001;

pub const CL_TRUE: cl_bool = 1;
pub const CL_FALSE: cl_bool = 0;

pub const CL_DEVICE_TYPE_GPU: cl_device_type = 1 << 2;

pub const CL_PLATFORM_NAME: cl_platform_info = 0x0902;
pub const CL_DEVICE_NAME: cl_device_info = 0x102B;
pub const CL_DEVICE_DOUBLE_FP_CONFIG: cl_device_info = 0x1032;

pub const CL_MEM_READ_WRITE: cl_mem_flags = 1 << 0;

pub const CL_PROGRAM_BUILD_LOG: cl_program_build_info = 0x1183;
