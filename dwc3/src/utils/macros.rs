// This macro family follows the fashion in xHCI crate.
// https://github.com/rust-osdev/xhci/blob/06d7b7a23683272ba590422c8eb4b502ad5f16cd/src/macros.rs
macro_rules! set_bits {
    ($range:expr, $method:ident, $ty:ty) => {
        paste::paste! {
            #[allow(unused)]
            pub fn [<set_ $method>](&mut self, value: $ty) -> &mut Self {
                use bit_field::BitField;
                use core::convert::TryInto;
                self.0.set_bits($range, value.try_into().unwrap());
                self
            }
        }
    };
    ($range:expr, $method:ident, $ty:ty, $doc:literal) => {
        paste::paste! {
            #[doc = $doc]
            #[allow(unused)]
            pub fn [<set_ $method>](&mut self, value: $ty) -> &mut Self {
                use bit_field::BitField;
                use core::convert::TryInto;
                self.0.set_bits($range, value.try_into().unwrap());
                self
            }
        }
    };
}

macro_rules! get_bits {
    ($range:expr, $method:ident, $ty:ty) => {
        paste::paste! {
            #[allow(unused)]
            pub fn [<get_ $method>](&self) -> $ty {
                use bit_field::BitField;
                self.0.get_bits($range).try_into().unwrap()
            }
        }
    };
    ($range:expr, $method:ident, $ty:ty, $doc:literal) => {
        paste::paste! {
            #[doc = $doc]
            #[allow(unused)]
            pub fn [<get_ $method>](&self) -> $ty {
                use bit_field::BitField;
                self.0.get_bits($range).try_into().unwrap()
            }
        }
    };
}

macro_rules! set_bit {
    ($bit:literal, $method:ident) => {
        paste::paste! {
            #[allow(unused)]
            pub fn [<set_ $method>](&mut self) -> &mut Self {
                use bit_field::BitField;
                self.0.set_bit($bit, true);
                self
            }
        }
    };

    ($bit:literal, $method:ident, $doc:literal) => {
        paste::paste! {
            #[doc = $doc]
            #[allow(unused)]
            pub fn [<set_ $method>](&mut self) -> &mut Self {
                use bit_field::BitField;
                self.0.set_bit($bit, true);
                self
            }
        }
    };
}

macro_rules! clear_bit {
    ($bit:literal, $method:ident) => {
        paste::paste! {
            #[allow(unused)]
            pub fn [<clear_ $method>](&mut self) -> &mut Self {
                use bit_field::BitField;
                self.0.set_bit($bit, false);
                self
            }
        }
    };

    ($bit:literal, $method:ident, $doc:literal) => {
        paste::paste! {
            #[doc = $doc]
            #[allow(unused)]
            pub fn [<clear_ $method>](&mut self) -> &mut Self {
                use bit_field::BitField;
                self.0.set_bit($bit, false);
                self
            }
        }
    };
}

macro_rules! get_bit {
    ($bit:literal, $method:ident) => {
        paste::paste! {
            #[allow(unused)]
            pub fn [<get_ $method>](&self) -> bool {
                use bit_field::BitField;
                self.0.get_bit($bit)
            }
        }
    };

    ($bit:literal, $method:ident, $doc:literal) => {
        paste::paste! {
            #[doc = $doc]
            #[allow(unused)]
            pub fn [<get_ $method>](&self) -> bool {
                use bit_field::BitField;
                self.0.get_bit($bit)
            }
        }
    };
}

macro_rules! rw_bit {
    ($bit:literal, $method:ident) => {
        set_bit!($bit, $method);
        clear_bit!($bit, $method);
        get_bit!($bit, $method);
    };

    ($bit:literal, $method:ident, $doc:literal) => {
        set_bit!($bit, $method, $doc);
        clear_bit!($bit, $method, $doc);
        get_bit!($bit, $method, $doc);
    };
}

macro_rules! rw_bits {
    ($range:expr, $method:ident, $ty:ty) => {
        set_bits!($range, $method, $ty);
        get_bits!($range, $method, $ty);
    };

    ($range:expr, $method:ident, $ty:ty, $doc:literal) => {
        set_bits!($range, $method, $ty, $doc);
        get_bits!($range, $method, $ty, $doc);
    };
}

macro_rules! auto_repr_tryfrom {
    (
        $(#[$outer:meta])*
        $v:vis enum $name:ident : $uint:ty {
            $(
                $(#[$doc:meta])*
                $variant:ident = $value:literal
            ),* $(,)?
        }
        $(,)?
    ) => {
        #[repr($uint)]
        $(#[$outer])*
        $v enum $name {
            $(
                $(#[$doc])*
                $variant = $value,
            )*
        }
        impl From<$name> for $uint {
            fn from(value: $name) -> Self {
                match value {
                    $(
                        $name::$variant => $value,
                    )*
                }
            }
        }
        impl TryFrom<$uint> for $name {
            type Error = $uint;
            fn try_from(value: $uint) -> core::result::Result<Self, Self::Error> {
                match value {
                    $(
                        $value => Ok($name::$variant),
                    )*
                    _ => Err(value),
                }
            }
        }
    };
}

macro_rules! auto_unit_from {
    (
        $(#[$outer:meta])*
        $v:vis struct $name:ident($uint:ty) $(;)?
    ) => {
        $(#[$outer])*
        $v struct $name($uint);
        impl From<$name> for $uint {
            fn from(value: $name) -> Self {
                value.0
            }
        }
        impl From<$uint> for $name {
            fn from(value: $uint) -> Self {
                Self(value)
            }
        }
    };
}
