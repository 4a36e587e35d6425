mod long_poll;

pub use long_poll::*;

/// Declares a metrics event whose handles are registered once and reused on
/// every emission.
///
/// ```ignore
/// registered_event! {
///     PollHint => {
///         delay: Histogram = histogram!("poll_delay_ms"),
///     }
///
///     fn emit(&self, delay_ms: f64) {
///         self.delay.record(delay_ms);
///     }
/// }
/// ```
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty)
        $emit_body:block
    ) => {
        #[derive(Clone)]
        pub struct $event {
            $( pub $field: $type, )*
        }

        impl $event {
            pub fn register() -> Self {
                Self {
                    $( $field: $value, )*
                }
            }

            pub fn emit(&$slf, $data_name: $data) $emit_body
        }

        impl ::std::fmt::Debug for $event {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(stringify!($event))
            }
        }
    };
}
