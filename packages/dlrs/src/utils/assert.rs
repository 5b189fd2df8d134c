/// Asserts element-wise closeness of two float collections of equal length
#[macro_export]
macro_rules! assert_all_relative_eq {
  ($left:expr, $right:expr, epsilon = $eps:expr) => {{
    let left: Vec<f64> = $left.into_iter().collect();
    let right: Vec<f64> = $right.into_iter().collect();
    pretty_assertions::assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(right.iter()) {
      approx::assert_relative_eq!(*l, *r, epsilon = $eps, max_relative = $eps);
    }
  }};
}
