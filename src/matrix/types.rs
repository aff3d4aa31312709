//! Типы матриц и связанные структуры

use crate::error::{MatrixError, Result};
use ndarray::Array2;
use rand::Rng;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, Weak};

static NEXT_MATRIX_ID: AtomicU64 = AtomicU64::new(1);

/// Ось, по которой запрашивается размер матрицы
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Количество строк
    Rows,
    /// Количество столбцов
    Columns,
    /// Общее количество элементов
    Total,
}

/// Хранилище, которое держит ресурсы, привязанные к матрице
pub(crate) trait Unbind: Send + Sync {
    /// Освобождает все, что привязано к матрице с номером `id`
    fn unbind(&self, id: u64);
}

/// Идентичность экземпляра матрицы.
///
/// Номер никогда не переиспользуется, клон матрицы получает новый. При
/// уничтожении матрицы все зарегистрированные хранилища получают
/// [`Unbind::unbind`], поэтому ресурсы устройства не переживают матрицу.
pub(crate) struct Identity {
    id: u64,
    holders: Mutex<Vec<Weak<dyn Unbind>>>,
}

impl Identity {
    fn fresh() -> Self {
        Self {
            id: NEXT_MATRIX_ID.fetch_add(1, Ordering::Relaxed),
            holders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Запоминает хранилище, которое нужно известить при уничтожении
    pub(crate) fn register(&self, holder: Weak<dyn Unbind>) {
        let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
        holders.retain(|known| known.strong_count() > 0);
        if !holders.iter().any(|known| Weak::ptr_eq(known, &holder)) {
            holders.push(holder);
        }
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        let holders = self.holders.get_mut().unwrap_or_else(PoisonError::into_inner);
        for holder in holders.drain(..) {
            if let Some(holder) = holder.upgrade() {
                holder.unbind(self.id);
            }
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.id).finish()
    }
}

/// Плотная прямоугольная матрица чисел двойной точности.
///
/// Данные хранятся построчно. Размеры фиксируются при создании и больше не
/// меняются.
pub struct Matrix {
    rows: usize,
    columns: usize,
    data: Vec<f64>,
    identity: Identity,
}

impl Matrix {
    /// Создает матрицу заданного размера, заполненную нулями
    pub fn new(rows: usize, columns: usize) -> Self {
        Self::filled(rows, columns, 0.0)
    }

    /// Создает матрицу, все элементы которой равны `value`
    pub fn filled(rows: usize, columns: usize, value: f64) -> Self {
        Self {
            rows,
            columns,
            data: vec![value; rows * columns],
            identity: Identity::fresh(),
        }
    }

    /// Создает матрицу со случайными элементами из `[0, 1)`
    pub fn random(rows: usize, columns: usize) -> Self {
        let mut rng = rand::thread_rng();
        let data = (0..rows * columns).map(|_| rng.gen_range(0.0..1.0)).collect();
        Self {
            rows,
            columns,
            data,
            identity: Identity::fresh(),
        }
    }

    /// Забирает готовый построчный буфер без копирования
    pub fn from_vec(rows: usize, columns: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * columns {
            return Err(MatrixError::BufferLength {
                rows,
                columns,
                actual: data.len(),
            });
        }
        Ok(Self {
            rows,
            columns,
            data,
            identity: Identity::fresh(),
        })
    }

    /// Создает матрицу из вложенного массива.
    ///
    /// Все внутренние массивы обязаны иметь одинаковую длину, иначе
    /// возвращается [`MatrixError::RaggedInput`] с индексом первого
    /// отличающегося элемента.
    pub fn from_rows<R: AsRef<[f64]>>(source: &[R]) -> Result<Self> {
        let columns = source.first().map_or(0, |row| row.as_ref().len());
        for (index, row) in source.iter().enumerate() {
            let actual = row.as_ref().len();
            if actual != columns {
                return Err(MatrixError::RaggedInput {
                    index,
                    expected: columns,
                    actual,
                });
            }
        }

        let mut data = Vec::with_capacity(source.len() * columns);
        for row in source {
            data.extend_from_slice(row.as_ref());
        }
        Ok(Self {
            rows: source.len(),
            columns,
            data,
            identity: Identity::fresh(),
        })
    }

    /// Размер матрицы по заданной оси
    pub fn dimension(&self, axis: Axis) -> usize {
        match axis {
            Axis::Rows => self.rows,
            Axis::Columns => self.columns,
            Axis::Total => self.data.len(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Пара (строки, столбцы)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.columns)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn offset(&self, row: usize, column: usize) -> Result<usize> {
        if row >= self.rows || column >= self.columns {
            return Err(MatrixError::IndexOutOfBounds {
                row,
                column,
                rows: self.rows,
                columns: self.columns,
            });
        }
        Ok(row * self.columns + column)
    }

    /// Читает элемент с проверкой границ
    pub fn get(&self, row: usize, column: usize) -> Result<f64> {
        let offset = self.offset(row, column)?;
        Ok(self.data[offset])
    }

    /// Записывает элемент с проверкой границ
    pub fn set(&mut self, row: usize, column: usize, value: f64) -> Result<()> {
        let offset = self.offset(row, column)?;
        self.data[offset] = value;
        Ok(())
    }

    /// Копия строки `row`
    pub fn row(&self, row: usize) -> Result<Vec<f64>> {
        if row >= self.rows {
            return Err(MatrixError::IndexOutOfBounds {
                row,
                column: 0,
                rows: self.rows,
                columns: self.columns,
            });
        }
        let start = row * self.columns;
        Ok(self.data[start..start + self.columns].to_vec())
    }

    /// Копия столбца `column`
    pub fn column(&self, column: usize) -> Result<Vec<f64>> {
        if column >= self.columns {
            return Err(MatrixError::IndexOutOfBounds {
                row: 0,
                column,
                rows: self.rows,
                columns: self.columns,
            });
        }
        Ok(self
            .data
            .iter()
            .skip(column)
            .step_by(self.columns)
            .copied()
            .collect())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Копия в виде `ndarray::Array2`
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows, self.columns), |(i, j)| {
            self.data[i * self.columns + j]
        })
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Канонический битовый образ: `-0.0` совпадает с `0.0`, все NaN совпадают
/// друг с другом. На нем построены `Eq` и `Hash`.
fn canonical_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

impl Clone for Matrix {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows,
            columns: self.columns,
            data: self.data.clone(),
            identity: Identity::fresh(),
        }
    }
}

impl PartialEq for Matrix {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.shape() != other.shape() {
            return false;
        }
        self.data
            .iter()
            .zip(&other.data)
            .all(|(a, b)| canonical_bits(*a) == canonical_bits(*b))
    }
}

impl Eq for Matrix {}

impl Hash for Matrix {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rows.hash(state);
        self.columns.hash(state);
        for value in &self.data {
            canonical_bits(*value).hash(state);
        }
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows)
            .field("columns", &self.columns)
            .field("data", &self.data)
            .finish()
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.rows {
            let line = &self.data[row * self.columns..(row + 1) * self.columns];
            write!(f, "[")?;
            for (j, value) in line.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", value)?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (row, column): (usize, usize)) -> &f64 {
        assert!(
            row < self.rows && column < self.columns,
            "index ({row}, {column}) is out of bounds for a {}x{} matrix",
            self.rows,
            self.columns
        );
        &self.data[row * self.columns + column]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (row, column): (usize, usize)) -> &mut f64 {
        assert!(
            row < self.rows && column < self.columns,
            "index ({row}, {column}) is out of bounds for a {}x{} matrix",
            self.rows,
            self.columns
        );
        &mut self.data[row * self.columns + column]
    }
}

impl From<Array2<f64>> for Matrix {
    fn from(array: Array2<f64>) -> Self {
        let (rows, columns) = array.dim();
        let data = if array.is_standard_layout() {
            let len = rows * columns;
            let (data, offset) = array.into_raw_vec_and_offset();
            match offset {
                _ if len == 0 => Vec::new(),
                Some(0) if data.len() == len => data,
                Some(start) => data[start..start + len].to_vec(),
                None => Vec::new(),
            }
        } else {
            array.iter().copied().collect()
        };
        Self {
            rows,
            columns,
            data,
            identity: Identity::fresh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::Arc;

    fn hash_of(matrix: &Matrix) -> u64 {
        let mut hasher = DefaultHasher::new();
        matrix.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn new_is_zero_filled() {
        let m = Matrix::new(10, 3);
        assert_eq!(m.dimension(Axis::Rows), 10);
        assert_eq!(m.dimension(Axis::Columns), 3);
        assert_eq!(m.dimension(Axis::Total), 30);
        assert!(m.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn from_rows_copies_row_major() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(m.get(0, 2).unwrap(), 3.0);
    }

    #[test]
    fn ragged_source_is_rejected() {
        let mut source = vec![vec![0.0; 3]; 10];
        source[0] = vec![0.0; 4];
        match Matrix::from_rows(&source) {
            Err(MatrixError::RaggedInput {
                index,
                expected,
                actual,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("expected RaggedInput, got {other:?}"),
        }
    }

    #[test]
    fn ragged_source_reports_later_offender() {
        let source = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0]];
        let err = Matrix::from_rows(&source).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::RaggedInput {
                index: 2,
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn empty_nested_source_builds_empty_matrix() {
        let source: Vec<Vec<f64>> = Vec::new();
        let m = Matrix::from_rows(&source).unwrap();
        assert_eq!(m.shape(), (0, 0));
        assert!(m.is_empty());
    }

    #[test]
    fn from_vec_adopts_buffer_without_copy() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let ptr = data.as_ptr();
        let m = Matrix::from_vec(3, 2, data).unwrap();
        assert_eq!(m.as_slice().as_ptr(), ptr);
        assert_eq!(m[(2, 1)], 6.0);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Matrix::from_vec(2, 2, vec![1.0; 3]).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::BufferLength {
                rows: 2,
                columns: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn checked_access_rejects_out_of_range() {
        let mut m = Matrix::new(2, 3);
        assert!(m.set(1, 2, 7.0).is_ok());
        assert_eq!(m.get(1, 2).unwrap(), 7.0);
        assert!(matches!(
            m.get(2, 0),
            Err(MatrixError::IndexOutOfBounds { row: 2, column: 0, .. })
        ));
        assert!(m.set(0, 3, 1.0).is_err());
        assert!(m.row(2).is_err());
        assert!(m.column(3).is_err());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn index_operator_panics_out_of_range() {
        let m = Matrix::new(2, 2);
        let _ = m[(0, 2)];
    }

    #[test]
    fn row_and_column_are_copies() {
        let mut m = Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).unwrap();
        let mut row = m.row(1).unwrap();
        let column = m.column(1).unwrap();
        assert_eq!(row, vec![3.0, 4.0]);
        assert_eq!(column, vec![2.0, 4.0, 6.0]);

        row[0] = 100.0;
        assert_eq!(m[(1, 0)], 3.0);
        m[(0, 1)] = -1.0;
        assert_eq!(column[0], 2.0);
    }

    #[test]
    fn equality_is_by_value() {
        let a = Matrix::filled(3, 3, 1.5);
        let b = Matrix::filled(3, 3, 1.5);
        let c = Matrix::filled(3, 3, 2.5);
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_ne!(a, c);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn equality_respects_shape() {
        let a = Matrix::new(2, 3);
        let b = Matrix::new(3, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn equality_is_consistent_for_signed_zero_and_nan() {
        let a = Matrix::from_vec(1, 2, vec![0.0, f64::NAN]).unwrap();
        let b = Matrix::from_vec(1, 2, vec![-0.0, f64::NAN]).unwrap();
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn clone_gets_new_identity() {
        let a = Matrix::filled(2, 2, 3.0);
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a.identity().id(), b.identity().id());
    }

    struct Released(Mutex<Vec<u64>>);

    impl Unbind for Released {
        fn unbind(&self, id: u64) {
            self.0.lock().unwrap().push(id);
        }
    }

    #[test]
    fn drop_notifies_registered_holders_once() {
        let released = Arc::new(Released(Mutex::new(Vec::new())));
        let holder: Arc<dyn Unbind> = released.clone();
        let m = Matrix::new(1, 1);
        let id = m.identity().id();
        m.identity().register(Arc::downgrade(&holder));
        m.identity().register(Arc::downgrade(&holder));
        let copy = m.clone();

        drop(m);
        assert_eq!(*released.0.lock().unwrap(), vec![id]);
        drop(copy);
        assert_eq!(released.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropped_holder_is_skipped() {
        let m = Matrix::new(1, 1);
        {
            let holder: Arc<dyn Unbind> = Arc::new(Released(Mutex::new(Vec::new())));
            m.identity().register(Arc::downgrade(&holder));
        }
        drop(m);
    }

    #[test]
    fn display_prints_one_row_per_line() {
        let m = Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.5]]).unwrap();
        assert_eq!(m.to_string(), "[1, 2]\n[3, 4.5]\n");
    }

    #[test]
    fn ndarray_round_trip() {
        let array = ndarray::arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let m = Matrix::from(array.clone());
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 2)], 6.0);
        assert_eq!(m.to_array(), array);

        let transposed = Matrix::from(array.reversed_axes());
        assert_eq!(transposed.shape(), (3, 2));
        assert_eq!(transposed[(2, 0)], 3.0);
    }

    #[test]
    fn sliced_array_keeps_only_its_view() {
        let array = ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let tail = array.slice_move(ndarray::s![1.., ..]);
        let m = Matrix::from(tail);
        assert_eq!(m, Matrix::from_rows(&[[3.0, 4.0], [5.0, 6.0]]).unwrap());
    }
}
