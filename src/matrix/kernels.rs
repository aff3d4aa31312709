//! Исходные коды ядер для матричных операций
//!
//! Все ядра имеют одну сигнатуру `(a, b, out, rows, cols, inner)` и
//! запускаются над пространством индексов результата `rows x cols`; каждый
//! поток вычисляет ровно одну ячейку. Транспонирование игнорирует `b`.

use crate::operator::Operation;

/// Общий пролог OpenCL-программ
const OPENCL_PROLOGUE: &str = r#"
#pragma OPENCL EXTENSION cl_khr_fp64 : enable
#pragma OPENCL FP_CONTRACT OFF
"#;

/// OpenCL: поэлементное сложение
pub static OPENCL_ADD_KERNEL: &str = r#"
__kernel void matrix_add(
    __global const double* a,
    __global const double* b,
    __global double* out,
    const int rows,
    const int cols,
    const int inner
) {
    const int row = get_global_id(0);
    const int col = get_global_id(1);
    if (row < rows && col < cols) {
        out[row * cols + col] = a[row * cols + col] + b[row * cols + col];
    }
}
"#;

/// OpenCL: поэлементное вычитание
pub static OPENCL_SUBTRACT_KERNEL: &str = r#"
__kernel void matrix_subtract(
    __global const double* a,
    __global const double* b,
    __global double* out,
    const int rows,
    const int cols,
    const int inner
) {
    const int row = get_global_id(0);
    const int col = get_global_id(1);
    if (row < rows && col < cols) {
        out[row * cols + col] = a[row * cols + col] - b[row * cols + col];
    }
}
"#;

/// OpenCL: наивное умножение, суммирование слева направо без fma
pub static OPENCL_MULTIPLY_KERNEL: &str = r#"
__kernel void matrix_multiply(
    __global const double* a,
    __global const double* b,
    __global double* out,
    const int rows,
    const int cols,
    const int inner
) {
    const int row = get_global_id(0);
    const int col = get_global_id(1);
    if (row < rows && col < cols) {
        double sum = 0.0;
        for (int k = 0; k < inner; k++) {
            double product = a[row * inner + k] * b[k * cols + col];
            sum = sum + product;
        }
        out[row * cols + col] = sum;
    }
}
"#;

/// OpenCL: транспонирование, `out` имеет форму `rows x cols`
pub static OPENCL_TRANSPOSE_KERNEL: &str = r#"
__kernel void matrix_transpose(
    __global const double* a,
    __global const double* b,
    __global double* out,
    const int rows,
    const int cols,
    const int inner
) {
    const int row = get_global_id(0);
    const int col = get_global_id(1);
    if (row < rows && col < cols) {
        out[row * cols + col] = a[col * rows + row];
    }
}
"#;

/// CUDA: все четыре ядра одним модулем, компилируется NVRTC с `--fmad=false`
pub static CUDA_KERNELS: &str = r#"
extern "C" __global__ void matrix_add(
    const double* a, const double* b, double* out, int rows, int cols, int inner)
{
    int row = blockIdx.y * blockDim.y + threadIdx.y;
    int col = blockIdx.x * blockDim.x + threadIdx.x;
    if (row < rows && col < cols) {
        out[row * cols + col] = a[row * cols + col] + b[row * cols + col];
    }
}

extern "C" __global__ void matrix_subtract(
    const double* a, const double* b, double* out, int rows, int cols, int inner)
{
    int row = blockIdx.y * blockDim.y + threadIdx.y;
    int col = blockIdx.x * blockDim.x + threadIdx.x;
    if (row < rows && col < cols) {
        out[row * cols + col] = a[row * cols + col] - b[row * cols + col];
    }
}

extern "C" __global__ void matrix_multiply(
    const double* a, const double* b, double* out, int rows, int cols, int inner)
{
    int row = blockIdx.y * blockDim.y + threadIdx.y;
    int col = blockIdx.x * blockDim.x + threadIdx.x;
    if (row < rows && col < cols) {
        double sum = 0.0;
        for (int k = 0; k < inner; k++) {
            sum += a[row * inner + k] * b[k * cols + col];
        }
        out[row * cols + col] = sum;
    }
}

extern "C" __global__ void matrix_transpose(
    const double* a, const double* b, double* out, int rows, int cols, int inner)
{
    int row = blockIdx.y * blockDim.y + threadIdx.y;
    int col = blockIdx.x * blockDim.x + threadIdx.x;
    if (row < rows && col < cols) {
        out[row * cols + col] = a[col * rows + row];
    }
}
"#;

/// Имя точки входа ядра для операции
pub fn kernel_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Add => "matrix_add",
        Operation::Subtract => "matrix_subtract",
        Operation::Multiply => "matrix_multiply",
        Operation::Transpose => "matrix_transpose",
    }
}

/// Полный исходный код OpenCL-программы для операции
pub fn opencl_source(operation: Operation) -> String {
    let body = match operation {
        Operation::Add => OPENCL_ADD_KERNEL,
        Operation::Subtract => OPENCL_SUBTRACT_KERNEL,
        Operation::Multiply => OPENCL_MULTIPLY_KERNEL,
        Operation::Transpose => OPENCL_TRANSPOSE_KERNEL,
    };
    format!("{}{}", OPENCL_PROLOGUE, body)
}
